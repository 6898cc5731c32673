//! Portable export bundles.
//!
//! Every exporter flips the model into the `Exported` state on success.
//! The weights layout inside a bundle is identical to the save-path blob,
//! so a loader only needs the 4-byte header-length prefix and the JSON
//! header to slice parameters out.

pub mod c_code;
pub mod wasm;

pub use c_code::{export_to_c, CExportConfig};
pub use wasm::export_to_wasm;
