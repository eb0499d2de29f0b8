//! Traffic specification: modifiers, protocol headers, template
//! expansion, packet lengths and transmit sequences.

pub mod header;
mod length;
mod modifier;
mod packet_template;
pub mod protocol;
mod sequence;

pub use length::{LengthConfig, LengthTemplate};
pub use modifier::{Modifier, ModifierValue, Mux};
pub use packet_template::{PacketTemplate, update_packet_header_lengths};
pub use sequence::{Definition, Sequence, SignatureConfig, Unpacked};

pub(crate) fn gcd(a: usize, b: usize) -> usize {
    if b == 0 { a } else { gcd(b, a % b) }
}

pub(crate) fn lcm(a: usize, b: usize) -> usize {
    if a == 0 || b == 0 { 0 } else { a / gcd(a, b) * b }
}
