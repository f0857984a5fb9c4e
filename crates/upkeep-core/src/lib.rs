mod error;
mod manifest;
mod package;
mod state;

pub use error::{AttemptError, UpgradeErrorKind};
pub use manifest::{Compatibility, UpgradeManifest, MANIFEST_ENTRY};
pub use package::UpgradePackage;
pub use state::{AttemptOutcome, AttemptState};
