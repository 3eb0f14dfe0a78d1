//! Input validation for values passed to the engine
//!
//! Every check here runs before any engine call, so a rejected value never
//! allocates a builder or opens a transaction.

use crate::core::error::{Error, Result};
use crate::utils::truncate_string;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Longest display name the engine accepts, in UTF-16 code units.
pub const MAX_DISPLAY_NAME_UNITS: usize = 256;

/// Validates a provider, sublayer or filter display name.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if the name:
/// - is empty
/// - contains a NUL character
/// - exceeds [`MAX_DISPLAY_NAME_UNITS`] UTF-16 code units
///
/// # Examples
///
/// ```
/// use wfpctl::validators::validate_display_name;
///
/// assert!(validate_display_name("VPN kill switch").is_ok());
/// assert!(validate_display_name("").is_err());
/// assert!(validate_display_name("bad\0name").is_err());
/// ```
pub fn validate_display_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidInput("display name is empty".to_string()));
    }
    if name.contains('\0') {
        return Err(Error::InvalidInput(format!(
            "display name '{}' contains a NUL character",
            truncate_string(&name.replace('\0', "\\0"), 32)
        )));
    }
    let units = name.encode_utf16().count();
    if units > MAX_DISPLAY_NAME_UNITS {
        return Err(Error::InvalidInput(format!(
            "display name '{}' too long ({units} > {MAX_DISPLAY_NAME_UNITS})",
            truncate_string(name, 32)
        )));
    }
    Ok(())
}

/// Validates an engine filter id; zero never identifies a filter.
pub fn validate_filter_id(id: u64) -> Result<()> {
    if id == 0 {
        Err(Error::InvalidInput("filter id must be non-zero".to_string()))
    } else {
        Ok(())
    }
}

/// Validates a prefix length against the family maximum (32 or 128).
pub fn validate_prefix_len(prefix_len: u8, max: u8) -> Result<()> {
    if prefix_len > max {
        Err(Error::InvalidInput(format!(
            "prefix length {prefix_len} exceeds {max}"
        )))
    } else {
        Ok(())
    }
}

/// Decodes a raw address: 4 bytes for IPv4, 16 bytes for IPv6.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] for any other length.
pub fn address_from_bytes(bytes: &[u8]) -> Result<IpAddr> {
    if let Ok(octets) = <[u8; 4]>::try_from(bytes) {
        Ok(IpAddr::V4(Ipv4Addr::from(octets)))
    } else if let Ok(octets) = <[u8; 16]>::try_from(bytes) {
        Ok(IpAddr::V6(Ipv6Addr::from(octets)))
    } else {
        Err(Error::InvalidInput(format!(
            "address must be 4 or 16 bytes, got {}",
            bytes.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;

    #[test]
    fn test_display_name_limits() {
        assert!(validate_display_name("x").is_ok());
        assert!(validate_display_name(&"a".repeat(MAX_DISPLAY_NAME_UNITS)).is_ok());
        let err = validate_display_name(&"a".repeat(MAX_DISPLAY_NAME_UNITS + 1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(err.to_string().contains("too long"));
    }

    #[test]
    fn test_display_name_counts_utf16_units() {
        // Each emoji is a surrogate pair
        let name = "🔒".repeat(MAX_DISPLAY_NAME_UNITS / 2);
        assert!(validate_display_name(&name).is_ok());
        assert!(validate_display_name(&format!("{name}x")).is_err());
    }

    #[test]
    fn test_display_name_nul_is_escaped_in_message() {
        let err = validate_display_name("a\0b").unwrap_err();
        assert!(err.to_string().contains("a\\0b"));
    }

    #[test]
    fn test_filter_id() {
        assert!(validate_filter_id(0).is_err());
        assert!(validate_filter_id(1).is_ok());
        assert!(validate_filter_id(u64::MAX).is_ok());
    }

    #[test]
    fn test_prefix_len() {
        assert!(validate_prefix_len(0, 32).is_ok());
        assert!(validate_prefix_len(32, 32).is_ok());
        assert!(validate_prefix_len(33, 32).is_err());
        assert!(validate_prefix_len(128, 128).is_ok());
        assert!(validate_prefix_len(129, 128).is_err());
    }

    #[test]
    fn test_address_from_bytes() {
        assert_eq!(
            address_from_bytes(&[10, 0, 0, 1]).unwrap(),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
        );
        assert_eq!(
            address_from_bytes(&Ipv6Addr::LOCALHOST.octets()).unwrap(),
            IpAddr::V6(Ipv6Addr::LOCALHOST)
        );
        assert!(address_from_bytes(&[]).is_err());
        assert!(address_from_bytes(&[1, 2, 3, 4, 5]).is_err());
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_display_name_without_nul_accepted(name in "[^\\x00]{1,100}") {
            prop_assert!(validate_display_name(&name).is_ok());
        }

        #[test]
        fn test_display_name_with_nul_rejected(
            prefix in "[a-z ]{0,20}",
            suffix in "[a-z ]{0,20}"
        ) {
            let name = format!("{prefix}\0{suffix}");
            prop_assert!(validate_display_name(&name).is_err());
        }

        #[test]
        fn test_prefix_len_consistency(
            prefix in any::<u8>(),
            max in prop_oneof![Just(32u8), Just(128u8)]
        ) {
            let result = validate_prefix_len(prefix, max);
            prop_assert_eq!(result.is_ok(), prefix <= max);
        }

        #[test]
        fn test_address_length_decides_family(
            bytes in proptest::collection::vec(any::<u8>(), 0..32)
        ) {
            match address_from_bytes(&bytes) {
                Ok(IpAddr::V4(addr)) => {
                    prop_assert_eq!(bytes.len(), 4);
                    prop_assert_eq!(addr.octets().to_vec(), bytes);
                }
                Ok(IpAddr::V6(addr)) => {
                    prop_assert_eq!(bytes.len(), 16);
                    prop_assert_eq!(addr.octets().to_vec(), bytes);
                }
                Err(_) => prop_assert!(bytes.len() != 4 && bytes.len() != 16),
            }
        }
    }
}
