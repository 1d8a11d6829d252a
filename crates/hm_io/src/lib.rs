//! I/O utilities for loading hardware images.
//!
//! Provides the parser for image descriptors and compute-unit selectors and
//! the file loader used by the host tool. Parsed images are returned as
//! [`hm_core::image::DeviceImage`] values ready for the simulated runtime.

/// File loading for hardware images.
///
/// Reads an image from disk, rejects vendor binary containers, and hands
/// the text to the parser.
pub mod loader;

/// Parser for image descriptors and kernel selectors.
///
/// Parses the line-oriented descriptor format and `kernel:{instance}`
/// selectors into the core image types.
pub mod parser;
