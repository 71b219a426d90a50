/// Controls codec construction and validation behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// When true, records carrying fields not declared in the schema are rejected.
    pub strict_mode: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { strict_mode: true }
    }
}
