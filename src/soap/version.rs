/// Namespace of SOAP 1.1 envelopes.
pub const SOAP11_NAMESPACE: &str = "http://schemas.xmlsoap.org/soap/envelope/";

/// Namespace of SOAP 1.2 envelopes.
pub const SOAP12_NAMESPACE: &str = "http://www.w3.org/2003/05/soap-envelope";

/// Fault code for an envelope in an unsupported namespace, in every version.
pub const VERSION_MISMATCH_CODE: &str = "VersionMismatch";

/// The SOAP protocol version of an envelope, and the structural rules that come with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SoapVersion {
    /// SOAP 1.1
    Soap11,

    /// SOAP 1.2
    Soap12,
}
impl SoapVersion {
    /// Returns the envelope namespace of the version.
    #[must_use]
    pub fn namespace(self) -> &'static str {
        match self {
            Self::Soap11 => SOAP11_NAMESPACE,
            Self::Soap12 => SOAP12_NAMESPACE,
        }
    }

    /// Returns the version whose envelope namespace is `namespace`.
    #[must_use]
    pub fn from_namespace(namespace: &str) -> Option<Self> {
        match namespace {
            SOAP11_NAMESPACE => Some(Self::Soap11),
            SOAP12_NAMESPACE => Some(Self::Soap12),
            _ => None,
        }
    }

    /// Fault code for messages the sender got wrong.
    #[must_use]
    pub fn sender_fault_code(self) -> &'static str {
        match self {
            Self::Soap11 => "Client",
            Self::Soap12 => "Sender",
        }
    }

    /// Fault code for failures on the receiving side.
    #[must_use]
    pub fn receiver_fault_code(self) -> &'static str {
        match self {
            Self::Soap11 => "Server",
            Self::Soap12 => "Receiver",
        }
    }

    /// Fault code for an envelope in an unsupported namespace.
    #[must_use]
    pub fn version_mismatch_code(self) -> &'static str {
        VERSION_MISMATCH_CODE
    }

    /// True if elements other than Header and Body may follow the Body.
    #[must_use]
    pub fn allows_trailing_elements(self) -> bool {
        self == Self::Soap11
    }
}
impl std::fmt::Display for SoapVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Soap11 => write!(f, "SOAP 1.1"),
            Self::Soap12 => write!(f, "SOAP 1.2"),
        }
    }
}
