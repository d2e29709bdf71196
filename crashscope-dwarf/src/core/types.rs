//! Plain result types handed back to tool frontends

/// Function identified for a query PC.
#[derive(Debug, Clone)]
pub struct FunctionInfo {
    pub name: String,
    pub low_pc: u64,
    pub high_pc: Option<u64>,
    pub decl_file: Option<String>,
    pub decl_line: Option<u64>,
}

/// Source coordinates resolved from the line table.
#[derive(Debug, Clone)]
pub struct SourceLocation {
    pub file: String,
    /// `None` when the line table has no row at or before the PC.
    pub line: Option<u64>,
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}", self.file, line),
            None => write!(f, "{}:?", self.file),
        }
    }
}
