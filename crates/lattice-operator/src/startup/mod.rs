//! Startup utilities

mod crds;
mod signal;

pub use crds::{crd_yaml, ensure_crds, CRD_NAME};
pub use signal::cancel_on_signal;
