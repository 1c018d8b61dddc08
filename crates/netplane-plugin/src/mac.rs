//! MAC address assignment.

use netplane_core::config::{format_mac, parse_mac, ControlPlaneConfig};
use netplane_core::Error;
use rand::Rng;

use crate::Result;

/// Generates port MAC addresses from a base MAC.
///
/// The first three octets of the base are kept. Each of the last three is
/// kept if non-zero and randomized if zero, so `fa:16:3e:00:00:00` yields
/// addresses anywhere in `fa:16:3e:xx:xx:xx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacGenerator {
    base: [u8; 6],
    retries: u32,
}

impl MacGenerator {
    /// Create a generator from parsed base octets.
    #[must_use]
    pub const fn new(base: [u8; 6], retries: u32) -> Self {
        Self { base, retries }
    }

    /// Create a generator from `base_mac` and `mac_generation_retries`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for a malformed base MAC.
    pub fn from_config(config: &ControlPlaneConfig) -> Result<Self> {
        Ok(Self::new(
            config.base_mac_octets()?,
            config.mac_generation_retries,
        ))
    }

    /// Attempts allowed before giving up on a unique address.
    #[must_use]
    pub const fn retries(&self) -> u32 {
        self.retries
    }

    /// Generate an address using the thread-local RNG.
    #[must_use]
    pub fn generate(&self) -> String {
        self.generate_with(&mut rand::thread_rng())
    }

    /// Generate an address using `rng`.
    pub fn generate_with<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        let mut octets = self.base;
        for octet in octets.iter_mut().skip(3) {
            if *octet == 0 {
                *octet = rng.gen();
            }
        }
        format_mac(&octets)
    }
}

/// Normalize a user-supplied MAC to lowercase colon-separated form.
///
/// # Errors
///
/// Returns `InvalidInput` for anything but six hex octets, or for a
/// multicast address.
pub fn normalize_mac(input: &str) -> Result<String> {
    let octets =
        parse_mac(input).ok_or_else(|| Error::InvalidInput(format!("Invalid MAC address: {input}")))?;
    if octets[0] & 0x01 != 0 {
        return Err(Error::InvalidInput(format!(
            "MAC address {input} is a multicast address"
        )));
    }
    Ok(format_mac(&octets))
}
