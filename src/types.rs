//! NewType wrappers for the identifiers that flow through the worker.
//!
//! Job ids, channel names and fingerprints are all strings on the wire;
//! wrapping them keeps a channel name from being passed where a job id is
//! expected.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

newtype_string!(
    /// Stable identifier of a build job, as delivered by the job queue.
    ///
    /// At most one task per `JobId` runs on a worker at any time.
    JobId
);

newtype_string!(
    /// Project identifier (a content id such as "Qmc3Wjp...").
    ProjectId
);

newtype_string!(
    /// Git branch name of a project, e.g. "master".
    BranchName
);

newtype_string!(
    /// Commit id a build runs against.
    CommitId
);

newtype_string!(
    /// Name of a fan-out channel observers attach to.
    ///
    /// Job status channels are named `build-<job id>`.
    ChannelName
);

newtype_string!(
    /// Identity of an observer attached to a fan-out channel.
    ///
    /// Attaching the same identity twice bumps a reference count instead of
    /// registering a second observer.
    ObserverId
);

newtype_string!(
    /// Key identifying one version of compiled script logic.
    ///
    /// Two jobs that share a fingerprint share one compiled context.
    Fingerprint
);

impl ChannelName {
    /// Status channel for a job.
    pub fn for_job(job_id: &JobId) -> Self {
        Self(format!("build-{}", job_id))
    }
}

impl Fingerprint {
    /// Derive a fingerprint from the identity of a script version.
    ///
    /// Each part is length-prefixed before hashing so that `("ab", "c")` and
    /// `("a", "bc")` never collide.
    pub fn derive(parts: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        let digest = hasher.finalize();
        Self(digest.iter().map(|b| format!("{:02x}", b)).collect())
    }
}
