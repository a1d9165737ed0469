//! Transfer requests and their decomposition into tasks

use ferrolift_io::TransferUri;
use ferrolift_types::{Error, ParentTask, Result, TenantId, TopTask};

/// One source to destination pair of a transfer request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferElement {
    /// Source URI
    pub source: String,
    /// Destination URI
    pub destination: String,
    /// A missing or failing optional element does not fail the transfer
    pub optional: bool,
}

impl TransferElement {
    /// Create a required element
    pub fn new<S: Into<String>, D: Into<String>>(source: S, destination: D) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            optional: false,
        }
    }

    /// Mark the element optional
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// A client transfer request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Tenant submitting the transfer
    pub tenant: TenantId,
    /// Owning user
    pub user: String,
    /// Free-form label
    pub tag: Option<String>,
    /// Source to destination pairs
    pub elements: Vec<TransferElement>,
}

impl TransferRequest {
    /// Create an empty request for a tenant and user
    pub fn new<T: Into<TenantId>, U: Into<String>>(tenant: T, user: U) -> Self {
        Self {
            tenant: tenant.into(),
            user: user.into(),
            tag: None,
            elements: Vec::new(),
        }
    }

    /// Set the tag
    pub fn with_tag<S: Into<String>>(mut self, tag: S) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Add a required element
    pub fn with_element<S: Into<String>, D: Into<String>>(self, source: S, destination: D) -> Self {
        self.with(TransferElement::new(source, destination))
    }

    /// Add an optional element
    pub fn with_optional_element<S: Into<String>, D: Into<String>>(
        self,
        source: S,
        destination: D,
    ) -> Self {
        self.with(TransferElement::new(source, destination).optional())
    }

    /// Add a prepared element
    pub fn with(mut self, element: TransferElement) -> Self {
        self.elements.push(element);
        self
    }

    /// Check tenant, user and every URI
    pub fn validate(&self) -> Result<()> {
        if self.tenant.trim().is_empty() {
            return Err(Error::invalid_request("tenant must not be empty"));
        }
        if self.user.trim().is_empty() {
            return Err(Error::invalid_request("user must not be empty"));
        }
        if self.elements.is_empty() {
            return Err(Error::invalid_request(
                "a transfer needs at least one element",
            ));
        }
        for element in &self.elements {
            TransferUri::parse(&element.source)?;
            TransferUri::parse(&element.destination)?;
        }
        Ok(())
    }

    /// Build the Top task and one Parent task per element
    pub fn into_tasks(self) -> Result<(TopTask, Vec<ParentTask>)> {
        self.validate()?;
        let mut top = TopTask::new(self.tenant, self.user);
        top.tag = self.tag;
        let parents = self
            .elements
            .into_iter()
            .map(|e| ParentTask::new(&top, e.source, e.destination, e.optional))
            .collect();
        Ok((top, parents))
    }
}
