//! Field modifiers: finite value sequences bound to protocol fields at
//! template-expansion time.

use rand::SeedableRng;
use rand::seq::SliceRandom;

use crate::Error;

/// Fixed permutation seed: a given configuration expands to the same
/// packet set on every run and host.
const PERMUTE_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

/// How multiple modifiers (or headers) combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mux {
    /// Parallel cycling; combined length is the lcm of the parts.
    Zip,
    /// Full product; combined length is the product of the parts.
    Cartesian,
}

/// A value a modifier can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifierValue {
    Field(u32),
    Ipv4([u8; 4]),
    Ipv6([u8; 16]),
    Mac([u8; 6]),
}

impl ModifierValue {
    /// Numeric embedding used for sequence stepping.
    fn to_u128(self) -> u128 {
        match self {
            ModifierValue::Field(value) => value as u128,
            ModifierValue::Ipv4(octets) => u32::from_be_bytes(octets) as u128,
            ModifierValue::Ipv6(octets) => u128::from_be_bytes(octets),
            ModifierValue::Mac(octets) => {
                let mut bytes = [0u8; 8];
                bytes[2..].copy_from_slice(&octets);
                u64::from_be_bytes(bytes) as u128
            }
        }
    }

    /// Rebuilds a value of the same kind from the numeric embedding,
    /// wrapping within the field's width.
    fn from_u128(self, value: u128) -> Self {
        match self {
            ModifierValue::Field(_) => ModifierValue::Field(value as u32),
            ModifierValue::Ipv4(_) => ModifierValue::Ipv4((value as u32).to_be_bytes()),
            ModifierValue::Ipv6(_) => ModifierValue::Ipv6(value.to_be_bytes()),
            ModifierValue::Mac(_) => {
                let bytes = ((value as u64) & 0xffff_ffff_ffff).to_be_bytes();
                let mut octets = [0u8; 6];
                octets.copy_from_slice(&bytes[2..]);
                ModifierValue::Mac(octets)
            }
        }
    }

    fn same_kind(&self, other: &ModifierValue) -> bool {
        matches!(
            (self, other),
            (ModifierValue::Field(_), ModifierValue::Field(_))
                | (ModifierValue::Ipv4(_), ModifierValue::Ipv4(_))
                | (ModifierValue::Ipv6(_), ModifierValue::Ipv6(_))
                | (ModifierValue::Mac(_), ModifierValue::Mac(_))
        )
    }
}

/// A deterministic, possibly permuted, skip-filtered range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceModifier {
    pub first: ModifierValue,
    pub last: Option<ModifierValue>,
    pub count: u32,
    pub skip: Vec<ModifierValue>,
    pub permute: bool,
}

/// An explicit item list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListModifier {
    pub items: Vec<ModifierValue>,
    pub permute: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modifier {
    Sequence(SequenceModifier),
    List(ListModifier),
}

impl Modifier {
    pub fn length(&self) -> usize {
        match self {
            Modifier::Sequence(sequence) => sequence.count as usize,
            Modifier::List(list) => list.items.len(),
        }
    }

    fn validate(&self) -> Result<(), Error> {
        match self {
            Modifier::Sequence(sequence) => {
                if sequence.count == 0 {
                    return Err(Error::BadSequence("count may not be zero".to_string()));
                }
                if let Some(last) = &sequence.last {
                    if !sequence.first.same_kind(last) {
                        return Err(Error::ModifierTypeMismatch);
                    }
                }
                if sequence
                    .skip
                    .iter()
                    .any(|skip| !sequence.first.same_kind(skip))
                {
                    return Err(Error::ModifierTypeMismatch);
                }
                Ok(())
            }
            Modifier::List(list) => {
                if list.items.is_empty() {
                    return Err(Error::BadSequence("list may not be empty".to_string()));
                }
                let first = list.items[0];
                if list.items.iter().any(|item| !first.same_kind(item)) {
                    return Err(Error::ModifierTypeMismatch);
                }
                Ok(())
            }
        }
    }

    /// Materializes the modifier's values, exactly `length()` of them.
    pub fn values(&self) -> Result<Vec<ModifierValue>, Error> {
        self.validate()?;

        let mut values = match self {
            Modifier::Sequence(sequence) => {
                let first = sequence.first.to_u128();
                let step = match &sequence.last {
                    Some(last) => {
                        last.to_u128().wrapping_sub(first) / sequence.count as u128
                    }
                    None => 1,
                };

                let candidates = sequence.count as usize + sequence.skip.len();
                (0..candidates)
                    .map(|idx| {
                        sequence
                            .first
                            .from_u128(first.wrapping_add(step.wrapping_mul(idx as u128)))
                    })
                    .filter(|value| !sequence.skip.contains(value))
                    .take(sequence.count as usize)
                    .collect::<Vec<_>>()
            }
            Modifier::List(list) => list.items.clone(),
        };

        if self.permute() {
            let mut rng = rand::rngs::StdRng::seed_from_u64(PERMUTE_SEED);
            values.shuffle(&mut rng);
        }

        Ok(values)
    }

    fn permute(&self) -> bool {
        match self {
            Modifier::Sequence(sequence) => sequence.permute,
            Modifier::List(list) => list.permute,
        }
    }
}
