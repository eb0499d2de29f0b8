//! Packet-length configuration and its expanded template.

use super::modifier::{ListModifier, Modifier, ModifierValue, SequenceModifier};
use crate::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LengthConfig {
    Fixed(u16),
    List(Vec<u16>),
    Sequence {
        first: u16,
        last: Option<u16>,
        count: u32,
        skip: Vec<u16>,
    },
}

impl LengthConfig {
    /// Expands the configuration into a concrete length vector.
    pub fn expand(&self) -> Result<Vec<u16>, Error> {
        match self {
            LengthConfig::Fixed(length) => Ok(vec![*length]),
            LengthConfig::List(lengths) => {
                if lengths.is_empty() {
                    return Err(Error::BadSequence(
                        "length list may not be empty".to_string(),
                    ));
                }
                Ok(lengths.clone())
            }
            LengthConfig::Sequence {
                first,
                last,
                count,
                skip,
            } => {
                let modifier = Modifier::Sequence(SequenceModifier {
                    first: ModifierValue::Field(*first as u32),
                    last: last.map(|last| ModifierValue::Field(last as u32)),
                    count: *count,
                    skip: skip
                        .iter()
                        .map(|&skip| ModifierValue::Field(skip as u32))
                        .collect(),
                    permute: false,
                });

                Ok(modifier
                    .values()?
                    .into_iter()
                    .map(|value| match value {
                        ModifierValue::Field(length) => length as u16,
                        _ => unreachable!("length sequences hold field values"),
                    })
                    .collect())
            }
        }
    }
}

/// The expanded length vector of one traffic definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthTemplate(Vec<u16>);

impl LengthTemplate {
    pub fn new(config: &LengthConfig) -> Result<Self, Error> {
        Ok(Self(config.expand()?))
    }

    pub fn lengths(&self) -> &[u16] {
        &self.0
    }

    pub fn max_packet_length(&self) -> u16 {
        self.0.iter().copied().max().unwrap_or(0)
    }

    pub fn into_inner(self) -> Vec<u16> {
        self.0
    }
}

impl From<ListModifier> for LengthConfig {
    fn from(list: ListModifier) -> Self {
        LengthConfig::List(
            list.items
                .iter()
                .filter_map(|item| match item {
                    ModifierValue::Field(value) => Some(*value as u16),
                    _ => None,
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_length() {
        assert_eq!(LengthConfig::Fixed(128).expand().unwrap(), vec![128]);
    }

    #[test]
    fn sequence_with_skip() {
        let config = LengthConfig::Sequence {
            first: 64,
            last: None,
            count: 4,
            skip: vec![66],
        };

        assert_eq!(config.expand().unwrap(), vec![64, 65, 67, 68]);
    }

    #[test]
    fn template_tracks_maximum() {
        let template =
            LengthTemplate::new(&LengthConfig::List(vec![64, 1518, 128])).unwrap();
        assert_eq!(template.max_packet_length(), 1518);
    }
}
