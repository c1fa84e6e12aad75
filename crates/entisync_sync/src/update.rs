//! Deciding whether a matched entity needs a modification.

use entisync_protocol::{LocalEntity, RemoteEntity};

/// Decides whether a local entity must be modified to match its remote
/// counterpart.
pub trait UpdateCheck {
    /// Returns true if `local` differs from `remote`.
    fn needs_update(&self, local: &LocalEntity, remote: &RemoteEntity) -> bool;
}

impl<F> UpdateCheck for F
where
    F: Fn(&LocalEntity, &RemoteEntity) -> bool,
{
    fn needs_update(&self, local: &LocalEntity, remote: &RemoteEntity) -> bool {
        self(local, remote)
    }
}

/// Compares revision, flags, payload parts and attributes.
///
/// Only what the remote side delivered is compared: parts and attributes
/// missing from the remote entity are left alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultUpdateCheck;

impl UpdateCheck for DefaultUpdateCheck {
    fn needs_update(&self, local: &LocalEntity, remote: &RemoteEntity) -> bool {
        if remote.clear_payload {
            return true;
        }
        if remote.remote_revision.is_some() && remote.remote_revision != local.remote_revision {
            return true;
        }
        if remote.flags != local.flags {
            return true;
        }

        let loaded = local.loaded_parts();
        if remote.parts.keys().any(|part| !loaded.contains(part.as_str())) {
            return true;
        }
        if remote
            .parts
            .iter()
            .any(|(part, data)| local.parts.get(part) != Some(data))
        {
            return true;
        }

        remote
            .attributes
            .iter()
            .any(|(kind, data)| local.attributes.get(kind) != Some(data))
    }
}
