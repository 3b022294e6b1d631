//! Reads x20 object/executable files.
//!
//! Wire format (all words little-endian `i32`):
//!
//! ```text
//! word 0: INSYMS_WORDS   (5 * number of insymbols)
//! word 1: OUTSYMS_WORDS  (5 * number of outsymbols)
//! word 2: CODE_WORDS
//! insymbols:  INSYMS_WORDS words,  5 per entry (4 name words + 1 address word)
//! outsymbols: OUTSYMS_WORDS words, 5 per entry (same shape)
//! code:       CODE_WORDS words
//! ```

use std::io::{self, Read};

use crate::consts::SYMBOL_ENTRY_WORDS;
use crate::error::LoadError;
use crate::symbol::{Symbol, SymbolTable};

/// The parsed contents of an object/executable file, before it is loaded
/// into a [`crate::Vm`]'s memory image.
#[derive(Debug, Clone)]
pub struct Program {
    pub insymbols: SymbolTable,
    pub outsymbols: SymbolTable,
    pub code: Vec<i32>,
}

impl Program {
    /// Reads and parses a program from any byte source.
    ///
    /// Loader is generic over [`Read`] rather than a file path, so tests
    /// and `linkx20` can feed it an in-memory cursor as easily as a file.
    pub fn read_from(mut r: impl Read) -> Result<Self, LoadError> {
        let insyms_words = read_word(&mut r)? as usize;
        let outsyms_words = read_word(&mut r)? as usize;
        let code_words = read_word(&mut r)? as usize;

        if insyms_words % SYMBOL_ENTRY_WORDS != 0 || outsyms_words % SYMBOL_ENTRY_WORDS != 0 {
            return Err(LoadError::NotValid);
        }

        let insymbols = read_symbol_table(&mut r, insyms_words / SYMBOL_ENTRY_WORDS)?;
        let outsymbols = read_symbol_table(&mut r, outsyms_words / SYMBOL_ENTRY_WORDS)?;
        let code = read_code(&mut r, code_words)?;

        Ok(Self {
            insymbols,
            outsymbols,
            code,
        })
    }
}

fn read_word(r: &mut impl Read) -> Result<i32, LoadError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).map_err(map_eof)?;
    Ok(i32::from_le_bytes(buf))
}

fn map_eof(e: io::Error) -> LoadError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        LoadError::NotValid
    } else {
        LoadError::Io(e)
    }
}

fn read_symbol_table(r: &mut impl Read, count: usize) -> Result<SymbolTable, LoadError> {
    let mut table = SymbolTable::new();
    for _ in 0..count {
        let mut name_bytes = [0u8; 16];
        r.read_exact(&mut name_bytes).map_err(map_eof)?;
        let nul = name_bytes.iter().position(|&b| b == 0).unwrap_or(16);
        let name = String::from_utf8_lossy(&name_bytes[..nul]).into_owned();
        let address = read_word(r)?;
        // Duplicate names within a single file's own symbol table are
        // malformed; duplicates *across* files are the linker's concern
        // (see `x20-tools`' `linkx20`), not the loader's.
        if !table.insert(Symbol { name, address }) {
            return Err(LoadError::NotValid);
        }
    }
    Ok(table)
}

fn read_code(r: &mut impl Read, count: usize) -> Result<Vec<i32>, LoadError> {
    let mut code = Vec::with_capacity(count);
    for _ in 0..count {
        code.push(read_word(r)?);
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_symbol(name: &str, address: i32) -> Vec<u8> {
        let mut bytes = vec![0u8; 16];
        bytes[..name.len()].copy_from_slice(name.as_bytes());
        bytes.extend_from_slice(&address.to_le_bytes());
        bytes
    }

    #[test]
    fn reads_minimal_executable() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(5i32).to_le_bytes()); // 1 insymbol
        bytes.extend_from_slice(&(0i32).to_le_bytes()); // 0 outsymbols
        bytes.extend_from_slice(&(1i32).to_le_bytes()); // 1 code word
        bytes.extend(encode_symbol("mainx20", 0));
        bytes.extend_from_slice(&(0i32).to_le_bytes()); // halt

        let program = Program::read_from(&bytes[..]).unwrap();
        assert_eq!(program.insymbols.get("mainx20").unwrap().address, 0);
        assert!(program.outsymbols.is_empty());
        assert_eq!(program.code, vec![0]);
    }

    #[test]
    fn truncated_file_is_not_valid() {
        let bytes = (5i32).to_le_bytes();
        assert!(matches!(
            Program::read_from(&bytes[..]),
            Err(LoadError::NotValid)
        ));
    }

    #[test]
    fn misaligned_symbol_section_length_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(3i32).to_le_bytes());
        bytes.extend_from_slice(&(0i32).to_le_bytes());
        bytes.extend_from_slice(&(0i32).to_le_bytes());
        assert!(matches!(
            Program::read_from(&bytes[..]),
            Err(LoadError::NotValid)
        ));
    }
}
