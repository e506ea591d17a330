//! Operation table shared by controllers and workers.
//!
//! Lifecycle operations are implemented by every worker. Domain operations
//! carry payloads the bridge treats as opaque JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::registry::Operation;

macro_rules! operation {
    ($(#[$meta:meta])* $ty:ident = $name:literal, ($($arg:ty),*) -> $out:ty) => {
        $(#[$meta])*
        #[derive(Debug)]
        pub enum $ty {}

        impl Operation for $ty {
            const NAME: &'static str = $name;
            type Args = ($($arg,)*);
            type Output = $out;
        }
    };
}

operation!(
    /// Initialise the worker after it first answers a ping.
    Onload = "onload", () -> ()
);
operation!(
    /// Release worker resources before the controller goes away.
    Unload = "unload", () -> ()
);
operation!(
    /// Apply the controller's configuration plus optional derived settings. Idempotent.
    UpdateConfig = "updateConfig", (Value, Option<Value>) -> ()
);
operation!(
    /// Restart worker activity under the current configuration.
    Restart = "restart", () -> ()
);
operation!(
    /// Record an edit of the given block.
    AddEditEvent = "addEditEvent", (String) -> ()
);
operation!(
    /// Record a document being viewed.
    AddViewEvent = "addViewEvent", (ViewEvent) -> ()
);
operation!(
    /// Import a notebook into a document block.
    ImportIpynb = "importIpynb", (String, Value, ImportMode) -> ()
);
operation!(
    /// Worker to controller: the available kernel specs changed.
    UpdateKernelSpecs = "updateKernelSpecs", (Value) -> ()
);
operation!(
    /// Worker to controller: the running kernel list changed.
    UpdateKernels = "updateKernels", (Vec<Value>) -> ()
);
operation!(
    /// Worker to controller: the session list changed.
    UpdateSessions = "updateSessions", (Vec<Value>) -> ()
);

/// Operations a worker serves.
pub const WORKER_OPERATIONS: &[&str] = &[
    Onload::NAME,
    Unload::NAME,
    UpdateConfig::NAME,
    Restart::NAME,
    AddEditEvent::NAME,
    AddViewEvent::NAME,
    ImportIpynb::NAME,
];

/// Operations a controller serves.
pub const MASTER_OPERATIONS: &[&str] = &[
    UpdateKernelSpecs::NAME,
    UpdateKernels::NAME,
    UpdateSessions::NAME,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewEvent {
    /// Document root block id.
    pub id: String,
    /// Notebook id.
    #[serde(rename = "box")]
    pub notebook: String,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportMode {
    Override,
    Append,
}
