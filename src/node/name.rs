/// A namespace-qualified name:
/// `{namespace}prefix:local`
///
/// Two names are equal when their namespace and local part match; the prefix
/// is only a serialization detail.
#[derive(Debug, Clone, Eq, Hash)]
pub struct QName {
    namespace: Option<String>,
    prefix: Option<String>,
    local: String,
}
impl QName {
    /// Create a name with no namespace.
    pub fn local(local: impl Into<String>) -> Self {
        Self {
            namespace: None,
            prefix: None,
            local: local.into(),
        }
    }

    /// Create a namespaced name with the given prefix.
    /// An empty prefix or namespace is treated as absent.
    pub fn new<T: Into<String>>(namespace: Option<T>, prefix: Option<T>, local: T) -> Self {
        Self {
            namespace: namespace.map(Into::into).filter(|s| !s.is_empty()),
            prefix: prefix.map(Into::into).filter(|s| !s.is_empty()),
            local: local.into(),
        }
    }

    /// Compare the name with a namespace and local name.
    #[must_use]
    pub fn equals(&self, namespace: Option<&str>, local: &str) -> bool {
        self.namespace.as_deref() == namespace && self.local == local
    }

    /// Returns the namespace URI of the name.
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Returns the prefix of the name.
    #[must_use]
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Returns the local portion of the name.
    #[must_use]
    pub fn local_name(&self) -> &str {
        &self.local
    }

    /// Returns a copy of the name using another prefix.
    #[must_use]
    pub fn with_prefix(mut self, prefix: Option<&str>) -> Self {
        self.prefix = prefix.filter(|s| !s.is_empty()).map(ToString::to_string);
        self
    }
}
impl std::fmt::Display for QName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(prefix) = &self.prefix {
            write!(f, "{prefix}:{local}", local = self.local)
        } else {
            write!(f, "{local}", local = self.local)
        }
    }
}
impl PartialEq for QName {
    fn eq(&self, other: &Self) -> bool {
        self.namespace == other.namespace && self.local == other.local
    }
}
impl From<&str> for QName {
    /// Parses `local` or `prefix:local`; the namespace is left unbound.
    fn from(name: &str) -> Self {
        match name.split_once(':') {
            Some((prefix, local)) => QName::new(None, Some(prefix), local),
            None => QName::local(name),
        }
    }
}

/// A namespace declaration on an element:
/// `xmlns:prefix="uri"`, or `xmlns="uri"` when the prefix is absent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    prefix: Option<String>,
    uri: String,
}
impl Namespace {
    /// Create a new declaration.
    pub fn new(prefix: Option<&str>, uri: impl Into<String>) -> Self {
        Self {
            prefix: prefix.filter(|s| !s.is_empty()).map(ToString::to_string),
            uri: uri.into(),
        }
    }

    /// Returns the declared prefix, or `None` for the default namespace.
    #[must_use]
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Returns the namespace URI.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }
}
