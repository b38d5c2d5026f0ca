use crate::{Error, Result};

/// Mark bits the programs use to tag packets they have already seen.
pub const DATAPLANE_MARK_BITS: u32 = 0x1ff0_0000;

/// Bits that have to stay free for the host's other mark users.
pub const MIN_SPARE_BITS: u32 = 4;

/// A validated packet mark mask.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MarkBits {
    mask: u32,
}

impl MarkBits {
    /// Fails when the mask cannot hold the dataplane's bits plus enough
    /// spare ones. Running with such a mask would mis-classify traffic, so
    /// the error is fatal.
    pub fn validate(mask: u32) -> Result<Self> {
        if mask & DATAPLANE_MARK_BITS != DATAPLANE_MARK_BITS {
            return Err(Error::FatalConfig(format!(
                "mark mask doesn't cover bits that are used by the BPF dataplane \
                 (mask {mask:#010x}, required {DATAPLANE_MARK_BITS:#010x})"
            )));
        }
        let spare = (mask & !DATAPLANE_MARK_BITS).count_ones();
        if spare < MIN_SPARE_BITS {
            return Err(Error::FatalConfig(format!(
                "not enough mark bits available (mask {mask:#010x} leaves {spare}, need {MIN_SPARE_BITS})"
            )));
        }
        Ok(Self { mask })
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_mask_is_valid() {
        let bits = MarkBits::validate(0xffff_0000).unwrap();
        assert_eq!(bits.mask(), 0xffff_0000);
    }

    #[test]
    fn test_mask_missing_dataplane_bits() {
        let err = MarkBits::validate(0x0fff_0000).unwrap_err();
        assert!(matches!(err, Error::FatalConfig(_)));
        assert!(
            err.to_string()
                .contains("mark mask doesn't cover bits that are used by the BPF dataplane")
        );
    }

    #[test]
    fn test_mask_without_spare_bits() {
        let err = MarkBits::validate(0x1ff0_0000 | 0x7).unwrap_err();
        assert!(err.to_string().contains("not enough mark bits available"));
        assert!(MarkBits::validate(0x1ff0_0000 | 0xf).is_ok());
    }
}
