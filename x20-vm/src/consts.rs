//! Fixed sizes and reserved register indices.

/// Total addressable memory, in words.
pub const MEM_WORDS: usize = 0x3_ffff;

/// Upper bound on the number of cores a single [`crate::Vm`] may run.
/// Kept as a sanity ceiling on `execute`'s `num_processors` argument.
pub const MAX_PROCESSORS: usize = 32;

/// Number of general-purpose and reserved registers per core.
pub const NUM_REGISTERS: usize = 16;

/// Frame pointer register index.
pub const FP: usize = 13;
/// Stack pointer register index.
pub const SP: usize = 14;
/// Program counter register index.
pub const PC: usize = 15;

/// Byte length of a symbol's name field in an object/executable file
/// (NUL-padded), before the one-word address that follows it.
pub const SYMBOL_NAME_WORDS: usize = 4;

/// Words per symbol table entry: 4 words of packed name bytes, 1 word of address.
pub const SYMBOL_ENTRY_WORDS: usize = SYMBOL_NAME_WORDS + 1;

/// The symbol every executable must define exactly once: the entry point.
pub const MAIN_SYMBOL: &str = "mainx20";
