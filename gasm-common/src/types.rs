// Core types and constants shared by the assembler crates

/// Version information
pub const GASM_VER_MAJOR: u32 = 0;
pub const GASM_VER_MINOR: u32 = 1;
pub const GASM_VER_BUGFIX: u32 = 0;

/// Full version string
pub fn gasm_version() -> String {
    format!(
        "gasm (transactional sequence assembler) v. {}.{}.{}",
        GASM_VER_MAJOR, GASM_VER_MINOR, GASM_VER_BUGFIX
    )
}

/// A fixed-length read sampled from the source sequence
pub type Segment = Vec<u8>;

/// A reconstructed sequence
pub type Sequence = Vec<u8>;

/// Symbols used by generated genes, in encoding order
pub const NUCLEOTIDES: [u8; 4] = *b"acgt";

/// Nucleotide encoding (a=0, c=1, g=2, t=3)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Base {
    A = 0,
    C = 1,
    G = 2,
    T = 3,
}

impl Base {
    /// Lowercase symbol for this base
    #[inline]
    pub fn symbol(self) -> u8 {
        NUCLEOTIDES[self as usize]
    }

    #[inline]
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0 => Some(Base::A),
            1 => Some(Base::C),
            2 => Some(Base::G),
            3 => Some(Base::T),
            _ => None,
        }
    }
}
