//! On-disk binary loading (ELF/PE, via `goblin`) and raw gadget candidate
//! extraction — the scanning half of the out-of-scope collaborator spec.md
//! leaves to the host binary. Adapted from `ropr::binary::Binary`: same
//! section/bitness split, same `.return_sites` patch for kernel return
//! thunks, with the classification itself left to `ropcraft-core`.

use crate::error::{Error, Result};
use goblin::{elf64::program_header::PF_X, pe::section_table::IMAGE_SCN_MEM_EXECUTE, Object};
use iced_x86::{Code, Decoder, DecoderOptions, FlowControl, Instruction, Mnemonic, OpKind, Register};
use rayon::prelude::*;
use std::{
	fs::read,
	path::{Path, PathBuf},
};

#[derive(Debug, Clone, Copy)]
pub enum Bitness {
	Bits32,
	Bits64,
}

impl Bitness {
	fn bits(self) -> u32 {
		match self {
			Bitness::Bits32 => 32,
			Bitness::Bits64 => 64,
		}
	}
}

pub struct Binary {
	path: PathBuf,
	bytes: Vec<u8>,
}

impl Binary {
	pub fn new(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		let bytes = read(path)?;
		Ok(Self { path: path.to_path_buf(), bytes })
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn get_sym_addr(&self, fnname: &str) -> Option<u64> {
		let Object::Elf(elf) = Object::parse(&self.bytes).ok()? else { return None };
		elf.syms.iter().find(|s| elf.strtab.get_at(s.st_name).unwrap_or("") == fnname).map(|s| s.st_value)
	}

	/// Patch every `.return_sites` entry with a literal `ret` (`c3 cc cc cc
	/// cc`), the same 5-byte patch `ropr` applies so kernel "return thunk"
	/// jumps scan as ordinary `ret`s instead of needing special-cased tail
	/// detection.
	pub fn apply_returnsites(&mut self) -> Result<()> {
		let Object::Elf(elf) = Object::parse(&self.bytes)? else { return Ok(()) };
		let Some(sites_hdr) = elf.section_headers.iter().find(|h| elf.shdr_strtab.get_at(h.sh_name).unwrap_or("") == ".return_sites")
		else {
			eprintln!(".return_sites section not found, skipping!");
			return Ok(());
		};
		let start = sites_hdr.sh_offset as usize;
		let end = start + sites_hdr.sh_size as usize;
		let data = self.bytes[start..end].to_vec();
		let return_sites: Vec<usize> = data
			.chunks(4)
			.enumerate()
			.map(|(idx, chunk)| i32::from_ne_bytes(chunk.try_into().expect("return_sites entry is 4 bytes")) as i64 as usize + sites_hdr.sh_addr as usize + idx * 4)
			.collect();

		if let Some(text_hdr) = elf.section_headers.iter().find(|h| elf.shdr_strtab.get_at(h.sh_name).unwrap_or("") == ".text") {
			let text_vaddr = text_hdr.sh_addr as usize;
			let text_offset = text_hdr.sh_offset as usize;
			let text_size = text_hdr.sh_size as usize;
			for vaddr in return_sites {
				let text_rel = vaddr - text_vaddr;
				if text_rel > text_size {
					continue; // probably .init.text, out of range for this section
				}
				let patch_at = text_offset + text_rel;
				self.bytes[patch_at..patch_at + 5].copy_from_slice(&[0xc3, 0xcc, 0xcc, 0xcc, 0xcc]);
			}
		}
		Ok(())
	}

	pub fn sections(&self) -> Result<Vec<Section<'_>>> {
		match Object::parse(&self.bytes)? {
			Object::Elf(e) => {
				let bitness = if e.is_64 { Bitness::Bits64 } else { Bitness::Bits32 };
				Ok(e
					.program_headers
					.iter()
					.filter(|h| h.p_flags & PF_X != 0)
					.map(|h| {
						let start = h.p_offset as usize;
						let end = start + h.p_filesz as usize;
						Section { file_offset: start, vaddr: h.p_vaddr, bytes: &self.bytes[start..end], bitness }
					})
					.collect())
			}
			Object::PE(p) => {
				let bitness = if p.is_64 { Bitness::Bits64 } else { Bitness::Bits32 };
				Ok(p
					.sections
					.iter()
					.filter(|s| s.characteristics & IMAGE_SCN_MEM_EXECUTE != 0)
					.map(|s| {
						let start = s.pointer_to_raw_data as usize;
						let end = start + s.size_of_raw_data as usize;
						Section {
							file_offset: start,
							vaddr: s.virtual_address as u64 + p.image_base as u64,
							bytes: &self.bytes[start..end],
							bitness,
						}
					})
					.collect())
			}
			_ => Err(Error::UnsupportedFormat),
		}
	}
}

pub struct Section<'b> {
	file_offset: usize,
	vaddr: u64,
	bytes: &'b [u8],
	bitness: Bitness,
}

impl Section<'_> {
	pub fn file_offset(&self) -> usize {
		self.file_offset
	}
	pub fn vaddr(&self) -> u64 {
		self.vaddr
	}
	pub fn bytes(&self) -> &[u8] {
		self.bytes
	}
	pub fn bitness(&self) -> Bitness {
		self.bitness
	}
}

/// Whether `instr` can end a gadget, and under which quality gate
/// (`ropr::rules::is_gadget_tail`, trimmed of the noisy/thunk-name options
/// `ropcraft`'s scanner doesn't expose — return-thunks are patched to real
/// `ret`s by `apply_returnsites` before this ever runs).
fn is_gadget_tail(instr: &Instruction, rop: bool, sys: bool, jop: bool) -> bool {
	if instr.code() == Code::INVALID || instr.flow_control() == FlowControl::Next {
		return false;
	}
	if rop && instr.mnemonic() == Mnemonic::Ret {
		return true;
	}
	if sys && matches!(instr.mnemonic(), Mnemonic::Syscall | Mnemonic::Sysenter) {
		return true;
	}
	if sys && instr.mnemonic() == Mnemonic::Int && instr.immediate8() == 0x80 {
		return true;
	}
	if jop && instr.mnemonic() == Mnemonic::Jmp {
		return match instr.op0_kind() {
			OpKind::Register => true,
			OpKind::Memory => !matches!(instr.memory_base(), Register::EIP | Register::RIP),
			_ => false,
		};
	}
	false
}

/// Whether `instr` may appear inside a gadget's body, i.e. before the tail
/// (`ropr::rules::is_rop_gadget_head`, non-noisy branch only: no prefixed
/// instructions, no calls, no conditional branches).
fn is_gadget_body(instr: &Instruction) -> bool {
	if instr.code() == Code::INVALID {
		return false;
	}
	if instr.has_lock_prefix() || instr.has_rep_prefix() || instr.has_repe_prefix() || instr.has_repne_prefix() {
		return false;
	}
	instr.flow_control() == FlowControl::Next
}

/// One candidate gadget window found at `tail_offset`: every valid starting
/// offset that decodes as a clean straight-line body up to and including
/// the tail instruction, capped at `max_instr` total instructions.
fn gadgets_ending_at(bytes: &[u8], base_addr: u64, tail_offset: usize, tail_len: usize, bits: u32, max_instr: usize) -> Vec<(u64, Vec<u8>)> {
	let mut out = Vec::new();
	let window_start = tail_offset.saturating_sub(max_instr * 16);
	for start in (window_start..=tail_offset).rev() {
		let mut decoder = Decoder::with_ip(bits, &bytes[start..], base_addr + start as u64, DecoderOptions::NONE);
		let mut count = 0usize;
		let mut ok = true;
		loop {
			if !decoder.can_decode() {
				ok = false;
				break;
			}
			let instr = decoder.decode();
			count += 1;
			let instr_end = start + decoder.position();
			if instr_end > tail_offset + tail_len {
				ok = false;
				break;
			}
			if instr_end == tail_offset + tail_len {
				break; // landed exactly on the tail's end: a valid gadget
			}
			if !is_gadget_body(&instr) || count > max_instr {
				ok = false;
				break;
			}
		}
		if ok && count <= max_instr {
			out.push((base_addr + start as u64, bytes[start..tail_offset + tail_len].to_vec()));
		}
	}
	out
}

/// Scan every executable section of `bin` for gadget candidates, in
/// parallel over tail offsets the way `ropr`'s `bin/ropr.rs` does with
/// `rayon`. Returns raw `(address, bytes)` pairs ready for
/// `GadgetDb::analyse_raw_gadgets`; classification/dedup happens there.
pub fn find_raw_gadgets(bin: &Binary, max_instr: usize, rop: bool, sys: bool, jop: bool) -> Result<Vec<(u64, Vec<u8>)>> {
	let sections = bin.sections()?;
	let raws = sections
		.iter()
		.flat_map(|sect| {
			let bits = sect.bitness().bits();
			let bytes = sect.bytes();
			let base = sect.vaddr();
			(0..bytes.len())
				.into_par_iter()
				.filter_map(move |offset| {
					let mut decoder = Decoder::with_ip(bits, &bytes[offset..], base + offset as u64, DecoderOptions::NONE);
					if !decoder.can_decode() {
						return None;
					}
					let instr = decoder.decode();
					if is_gadget_tail(&instr, rop, sys, jop) {
						Some((offset, decoder.position()))
					} else {
						None
					}
				})
				.flat_map_iter(|(tail_offset, tail_len)| gadgets_ending_at(bytes, base, tail_offset, tail_len, bits, max_instr))
				.collect::<Vec<_>>()
		})
		.collect();
	Ok(raws)
}
