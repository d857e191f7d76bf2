//! ROP chain value type and its renderers (spec 6: pretty, Python, binary).

use crate::arch::Arch;
use crate::gadget::Gadget;
use std::sync::Arc;

/// One item of the final chain. Holds a non-owning reference to its
/// gadget — valid for the chain's lifetime because the `GadgetDb` that
/// produced it outlives the chain by contract (spec 3: "Lifetimes").
#[derive(Debug, Clone)]
pub enum RopItem {
	Gadget { addr: u64, gadget: Arc<Gadget> },
	Padding { value: u64, message: Option<String> },
	/// A padding word that names another node's gadget address (so it gets
	/// an ASLR `+ off` adjustment on Python rendering, unlike an ordinary
	/// constant padding).
	GadgetAddress { value: u64, message: Option<String> },
}

#[derive(Debug, Clone, Default)]
pub struct RopChain {
	pub items: Vec<RopItem>,
}

impl RopChain {
	pub fn new(items: Vec<RopItem>) -> Self {
		RopChain { items }
	}

	pub fn len(&self) -> usize {
		self.items.len()
	}
	pub fn is_empty(&self) -> bool {
		self.items.is_empty()
	}

	/// One line per item: hex address (arch-width zero-padded), then the
	/// disassembly for gadgets or an optional message for paddings.
	pub fn to_pretty(&self, arch: &dyn Arch) -> String {
		let width = arch.word_size() * 2;
		let mut out = String::new();
		for item in &self.items {
			match item {
				RopItem::Gadget { addr, gadget } => {
					out.push_str(&format!("0x{addr:0width$x}: {}\n", gadget.asm_str));
				}
				RopItem::Padding { value, message } => {
					out.push_str(&format!("0x{value:0width$x}"));
					if let Some(m) = message {
						out.push_str(&format!("  ; {m}"));
					}
					out.push('\n');
				}
				RopItem::GadgetAddress { value, message } => {
					out.push_str(&format!("0x{value:0width$x}"));
					if let Some(m) = message {
						out.push_str(&format!("  ; {m}"));
					}
					out.push('\n');
				}
			}
		}
		out
	}

	/// `from struct import pack` boilerplate, one `p += pack(...)` per
	/// item; gadget addresses and gadget-address paddings carry `+ off`
	/// so the script can be re-based under ASLR.
	pub fn to_python(&self, arch: &dyn Arch) -> String {
		let fmt = match arch.word_size() {
			4 => "<I",
			8 => "<Q",
			_ => "<Q",
		};
		let mut out = String::from("from struct import pack\n\np = b\"\"\n");
		for item in &self.items {
			match item {
				RopItem::Gadget { addr, gadget } => {
					out.push_str(&format!("p += pack(\"{fmt}\", 0x{addr:x} + off)  # {}\n", gadget.asm_str));
				}
				RopItem::GadgetAddress { value, message } => {
					let msg = message.clone().unwrap_or_default();
					out.push_str(&format!("p += pack(\"{fmt}\", 0x{value:x} + off)  # {msg}\n"));
				}
				RopItem::Padding { value, message } => {
					let msg = message.clone().map(|m| format!("  # {m}")).unwrap_or_default();
					out.push_str(&format!("p += pack(\"{fmt}\", 0x{value:x}){msg}\n"));
				}
			}
		}
		out
	}

	/// Little-endian, arch-word-wide concatenation of every item's value.
	pub fn to_binary(&self, arch: &dyn Arch) -> Vec<u8> {
		let word = arch.word_size();
		let mut out = Vec::with_capacity(self.items.len() * word);
		for item in &self.items {
			let v = match item {
				RopItem::Gadget { addr, .. } => *addr,
				RopItem::Padding { value, .. } | RopItem::GadgetAddress { value, .. } => *value,
			};
			out.extend_from_slice(&v.to_le_bytes()[..word]);
		}
		out
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::arch::test_arch::ToyArch;

	#[test]
	fn binary_rendering_is_little_endian_word_width() {
		let chain = RopChain::new(vec![RopItem::Padding { value: 0xdeadbeef, message: None }]);
		let arch = ToyArch; // word_size = 4
		assert_eq!(chain.to_binary(&arch), vec![0xef, 0xbe, 0xad, 0xde]);
	}

	#[test]
	fn python_rendering_adds_aslr_offset_to_gadget_addresses() {
		let chain = RopChain::new(vec![RopItem::GadgetAddress { value: 0x1000, message: Some("adjust".into()) }]);
		let arch = ToyArch;
		let py = chain.to_python(&arch);
		assert!(py.contains("0x1000 + off"));
	}
}
