//! Device-to-device sync gating.
//!
//! Two devices of the same user may sync only when an approval links them in
//! at least one direction: the local device approved by the peer, or the peer
//! approved by the local device. Each approval must carry a valid signature by
//! the approver's identity key, name the subject's current identity key, and
//! be unexpired.

use chrono::{DateTime, Utc};
use nkc_crypto::identity::{DeviceApproval, PublicKeyBytes};
use tracing::debug;

/// One side of a device pairing.
pub struct DeviceKey<'a> {
    pub device_id: &'a str,
    pub identity_pub: &'a PublicKeyBytes,
}

fn approves(approval: &DeviceApproval, approver: &DeviceKey<'_>, subject: &DeviceKey<'_>, now: DateTime<Utc>) -> bool {
    approval.approver_device_id == approver.device_id
        && approval.subject_device_id == subject.device_id
        && &approval.subject_pub == subject.identity_pub
        && approval.verify(approver.identity_pub, now).is_ok()
}

/// True when `approvals` contain a valid approval in either direction.
pub fn mutually_resolvable(
    approvals: &[DeviceApproval],
    local: &DeviceKey<'_>,
    peer: &DeviceKey<'_>,
    now: DateTime<Utc>,
) -> bool {
    let ok = approvals
        .iter()
        .any(|a| approves(a, peer, local, now) || approves(a, local, peer, now));
    if !ok {
        debug!(local = local.device_id, peer = peer.device_id, "no device approval");
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use nkc_crypto::identity::IdentityKeyPair;

    #[test]
    fn either_direction_suffices() {
        let a = IdentityKeyPair::generate();
        let b = IdentityKeyPair::generate();
        let ka = DeviceKey { device_id: "a", identity_pub: &a.public };
        let kb = DeviceKey { device_id: "b", identity_pub: &b.public };

        let a_approves_b = DeviceApproval::issue(&a, "a", "b", &b.public, Duration::hours(1)).unwrap();
        assert!(mutually_resolvable(&[a_approves_b.clone()], &ka, &kb, Utc::now()));
        assert!(mutually_resolvable(&[a_approves_b], &kb, &ka, Utc::now()));
        assert!(!mutually_resolvable(&[], &ka, &kb, Utc::now()));
    }

    #[test]
    fn expired_or_rekeyed_subject_rejected() {
        let a = IdentityKeyPair::generate();
        let b = IdentityKeyPair::generate();
        let ka = DeviceKey { device_id: "a", identity_pub: &a.public };
        let kb = DeviceKey { device_id: "b", identity_pub: &b.public };
        let approval = DeviceApproval::issue(&a, "a", "b", &b.public, Duration::hours(1)).unwrap();
        assert!(!mutually_resolvable(
            &[approval.clone()],
            &ka,
            &kb,
            Utc::now() + Duration::hours(2)
        ));

        let b2 = IdentityKeyPair::generate();
        let kb2 = DeviceKey { device_id: "b", identity_pub: &b2.public };
        assert!(!mutually_resolvable(&[approval], &ka, &kb2, Utc::now()));
    }
}
