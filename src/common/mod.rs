//! Cross-cutting helpers shared by the binary and the services.

pub mod logger;
