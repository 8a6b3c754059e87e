// Provider Bundle Loading
//
// Materializes Provider values from the sources listed in the admin policy:
// local directories and Git repositories pinned to a ref. Loading happens at
// server start and on explicit reload, never on the submission path.

pub mod loader;

pub use loader::{LoadReport, ProviderLoader};
