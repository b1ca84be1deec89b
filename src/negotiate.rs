//! Device negotiation state machine.
//!
//! Drives the prescribed status-bit progression
//! `RESET -> ACKNOWLEDGE -> DRIVER -> features -> DRIVER_OK` for both legacy
//! and modern devices, carrying the cumulative status byte between steps.
//! Modern devices get the full 64-bit feature handshake with the
//! `FEATURES_OK` round trip; legacy devices take the 32-bit shortcut without
//! it.

use core::fmt;

use log::{debug, error};

use crate::endian::WireFormat;
use crate::features;
use crate::transport::{DeviceStatus, Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationError {
    Transport(TransportError),
    /// Modern transport whose device does not offer `VIRTIO_F_VERSION_1`.
    VersionUnsupported,
    /// The host cleared `FEATURES_OK` after the driver set it.
    Rejected,
}

impl fmt::Display for NegotiationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(err) => write!(f, "transport fault during negotiation: {err}"),
            Self::VersionUnsupported => write!(f, "device does not offer VERSION_1"),
            Self::Rejected => write!(f, "host rejected the offered feature set"),
        }
    }
}

impl From<TransportError> for NegotiationError {
    fn from(value: TransportError) -> Self {
        Self::Transport(value)
    }
}

/// Outcome of a successful feature handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    /// Feature bits accepted by both sides.
    pub features: u64,
    /// Byte-order adapter locked in for the device's lifetime.
    pub wire: WireFormat,
}

/// One in-progress bring-up of a device instance.
///
/// Status bits only ever accumulate here; `fail` ORs in `FAILED` and leaves
/// the device quiesced until the next reset.
pub struct Handshake {
    status: DeviceStatus,
}

impl Handshake {
    /// Reset the device and walk it to the DRIVER state.
    pub fn begin<T: Transport>(transport: &T) -> Result<Self, NegotiationError> {
        transport.reset()?;
        let mut handshake = Self {
            status: DeviceStatus::empty(),
        };
        handshake.advance(transport, DeviceStatus::ACKNOWLEDGE);
        handshake.advance(transport, DeviceStatus::DRIVER);
        Ok(handshake)
    }

    fn advance<T: Transport>(&mut self, transport: &T, bit: DeviceStatus) {
        self.status = self.status.with(bit);
        transport.set_status(self.status);
    }

    /// Run the feature handshake, offering `supported`.
    ///
    /// The accepted set is always the intersection of what the device
    /// advertises and what the caller supports; legacy devices only see the
    /// low 32 bits and skip the `FEATURES_OK` acknowledgement.
    pub fn negotiate<T: Transport>(
        &mut self,
        transport: &T,
        supported: u64,
    ) -> Result<Negotiated, NegotiationError> {
        if transport.is_legacy() {
            let host = transport.read_device_features(0) as u64;
            let accepted = host & supported & u32::MAX as u64;
            transport.write_driver_features(0, accepted as u32);
            debug!("negotiated legacy features {accepted:#x}");
            return Ok(Negotiated {
                features: accepted,
                wire: WireFormat::LEGACY,
            });
        }

        let host = transport.read_device_features64();
        if host & features::VERSION_1 == 0 {
            error!("modern transport but device lacks VERSION_1 (host features {host:#x})");
            return Err(NegotiationError::VersionUnsupported);
        }
        let accepted = host & supported;
        transport.write_driver_features64(accepted);
        self.advance(transport, DeviceStatus::FEATURES_OK);
        if !transport.status().contains(DeviceStatus::FEATURES_OK) {
            error!("host cleared FEATURES_OK for offer {accepted:#x}");
            return Err(NegotiationError::Rejected);
        }
        debug!("negotiated modern features {accepted:#x}");
        Ok(Negotiated {
            features: accepted,
            wire: WireFormat::MODERN,
        })
    }

    /// Mark the driver ready. Only call once every queue is programmed.
    pub fn finish<T: Transport>(&mut self, transport: &T) {
        self.advance(transport, DeviceStatus::DRIVER_OK);
    }

    /// Abandon the bring-up, leaving `FAILED` latched in the status.
    pub fn fail<T: Transport>(&mut self, transport: &T) {
        self.advance(transport, DeviceStatus::FAILED);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubTransport;

    #[test]
    fn legacy_trajectory_skips_features_ok() {
        let transport = StubTransport::legacy(8);
        transport.set_host_features(1 << 5);
        let mut handshake = Handshake::begin(&transport).expect("begin");
        let negotiated = handshake
            .negotiate(&transport, (1 << 5) | crate::features::VERSION_1)
            .expect("negotiate");
        handshake.finish(&transport);

        assert_eq!(transport.status_writes(), vec![1, 3, 7]);
        assert_eq!(negotiated.features, 1 << 5);
        assert!(!negotiated.wire.is_modern());
    }

    #[test]
    fn modern_trajectory_keeps_features_ok() {
        let transport = StubTransport::modern(8);
        transport.set_host_features(crate::features::VERSION_1 | (1 << 6));
        let mut handshake = Handshake::begin(&transport).expect("begin");
        let negotiated = handshake
            .negotiate(&transport, crate::features::VERSION_1 | (1 << 6))
            .expect("negotiate");
        handshake.finish(&transport);

        assert_eq!(transport.status_writes(), vec![1, 3, 11, 15]);
        assert_eq!(negotiated.features, crate::features::VERSION_1 | (1 << 6));
        assert!(negotiated.wire.is_modern());
    }

    #[test]
    fn host_clearing_features_ok_rejects() {
        let transport = StubTransport::modern(8);
        transport.set_host_features(crate::features::VERSION_1);
        transport.veto_features_ok();
        let mut handshake = Handshake::begin(&transport).expect("begin");
        let err = handshake
            .negotiate(&transport, crate::features::VERSION_1)
            .unwrap_err();
        handshake.fail(&transport);

        assert_eq!(err, NegotiationError::Rejected);
        assert_eq!(transport.status().bits() & 128, 128);
    }

    #[test]
    fn missing_version_1_is_fatal_on_modern() {
        let transport = StubTransport::modern(8);
        transport.set_host_features(1 << 6);
        let mut handshake = Handshake::begin(&transport).expect("begin");
        assert_eq!(
            handshake.negotiate(&transport, crate::features::VERSION_1),
            Err(NegotiationError::VersionUnsupported)
        );
    }

    #[test]
    fn reset_then_init_repeats_the_trajectory() {
        let transport = StubTransport::legacy(8);
        transport.set_host_features(0);

        let mut first = Handshake::begin(&transport).expect("begin");
        first.negotiate(&transport, crate::features::VERSION_1).expect("negotiate");
        first.finish(&transport);
        let first_writes = transport.status_writes();

        transport.clear_status_log();
        let mut second = Handshake::begin(&transport).expect("begin again");
        second.negotiate(&transport, crate::features::VERSION_1).expect("negotiate");
        second.finish(&transport);

        assert_eq!(first_writes, transport.status_writes());
    }
}
