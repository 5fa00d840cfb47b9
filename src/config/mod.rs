//! Declaration module for the convergence engine.
//!
//! This module handles everything about the desired-state declaration:
//! - Parsing and deserializing `converge.yaml`
//! - Validation of names, references and attribute types
//! - Content hashing for change detection

mod spec;
mod parser;
mod validator;
mod hash;

pub use spec::{
    AttrValue, CommandTemplates, Declaration, ProbeSettings, ReportBackend, ReportConfig,
    ResourceDecl, ResourceKind, TargetConfig,
};
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, expand_home, find_config_file};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
pub use hash::ContentHasher;
