//! Raw gadget file I/O: `HEXADDR$BYTES` per line, as written by `scan` and
//! consumed by `compile`'s `GadgetDb::analyse_raw_gadgets`.

use crate::error::{CliError, Result};
use std::fs;
use std::path::Path;

pub fn read(path: &Path) -> Result<Vec<(u64, Vec<u8>)>> {
	let text = fs::read_to_string(path)?;
	let mut out = Vec::new();
	for (i, line) in text.lines().enumerate() {
		let line = line.trim();
		if line.is_empty() {
			continue;
		}
		let Some((addr_str, bytes_str)) = line.split_once('$') else {
			return Err(CliError::BadGadgetLine(i + 1, format!("missing '$' separator in '{line}'")));
		};
		let addr = u64::from_str_radix(addr_str, 16).map_err(|e| CliError::BadGadgetLine(i + 1, format!("bad address: {e}")))?;
		if addr == 0 {
			return Err(CliError::BadGadgetLine(i + 1, "address 0 is invalid".into()));
		}
		if bytes_str.len() % 2 != 0 || !bytes_str.bytes().all(|b| b.is_ascii_hexdigit()) {
			return Err(CliError::BadGadgetLine(i + 1, format!("bytes field '{bytes_str}' is not even-length hex")));
		}
		let bytes = (0..bytes_str.len())
			.step_by(2)
			.map(|j| u8::from_str_radix(&bytes_str[j..j + 2], 16).unwrap())
			.collect();
		out.push((addr, bytes));
	}
	Ok(out)
}

pub fn write(path: &Path, gadgets: &[(u64, Vec<u8>)]) -> Result<()> {
	let mut out = String::new();
	for (addr, bytes) in gadgets {
		out.push_str(&format!("{addr:x}${}\n", bytes.iter().map(|b| format!("{b:02x}")).collect::<String>()));
	}
	fs::write(path, out)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write as _;

	#[test]
	fn round_trips_simple_file() {
		let dir = std::env::temp_dir();
		let path = dir.join("ropcraft-test-gadgets.txt");
		{
			let mut f = fs::File::create(&path).unwrap();
			writeln!(f, "1000$c3").unwrap();
		}
		let got = read(&path).unwrap();
		assert_eq!(got, vec![(0x1000, vec![0xc3])]);
		let _ = fs::remove_file(&path);
	}

	#[test]
	fn rejects_zero_address() {
		let dir = std::env::temp_dir();
		let path = dir.join("ropcraft-test-gadgets-zero.txt");
		fs::write(&path, "0$c3\n").unwrap();
		assert!(read(&path).is_err());
		let _ = fs::remove_file(&path);
	}
}
