/// A processing instruction node:
/// `<?target data?>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingInstruction {
    target: String,
    data: Option<String>,
}
impl ProcessingInstruction {
    /// Create a new processing instruction node.
    pub fn new(target: impl Into<String>, data: Option<String>) -> Self {
        Self {
            target: target.into(),
            data,
        }
    }

    /// Returns the target of the processing instruction.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Returns the data of the processing instruction.
    #[must_use]
    pub fn data(&self) -> Option<&str> {
        self.data.as_deref()
    }
}
