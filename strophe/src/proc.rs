use crate::{Result, RuntimeError};

const PROC_SIZE_LEN: usize = 4;
const PROC_COUNTS_LEN: usize = 6;
const LEXICAL_RECORD_LEN: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LexicalTarget {
    Argument = 0,
    Local = 1,
}

impl LexicalTarget {
    #[must_use]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(LexicalTarget::Argument),
            1 => Some(LexicalTarget::Local),
            _ => None,
        }
    }
}

/// A free variable of a procedure, bound to a slot of a live ancestor frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcLexical {
    pub activation_call: u32,
    pub target_offset: u32,
    pub target: LexicalTarget,
}

/// Decoded procedure header.
///
/// ```text
/// u32 procSize        bytes following this field
/// u16 numArguments
/// u16 numLocals
/// u16 numLexicals
/// numLexicals x { u32 activationCall, u32 targetOffset, u8 kind }
/// body
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcInfo {
    pub proc_offset: u32,
    pub proc_size: u32,
    pub num_arguments: u16,
    pub num_locals: u16,
    pub lexicals: Vec<ProcLexical>,
    /// Segment-relative offset of the first body byte.
    pub body_offset: u32,
    pub body_len: u32,
}

impl ProcInfo {
    #[must_use]
    pub fn num_lexicals(&self) -> u16 {
        self.lexicals.len() as u16
    }
}

#[inline]
fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[inline]
fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

pub fn parse_proc_info(bytecode: &[u8], proc_offset: u32) -> Result<ProcInfo> {
    let start = proc_offset as usize;
    let counts_at = start
        .checked_add(PROC_SIZE_LEN)
        .filter(|end| *end <= bytecode.len())
        .ok_or_else(|| RuntimeError::invariant("invalid proc offset"))?;

    let proc_size = read_u32(bytecode, start);
    let proc_end = counts_at
        .checked_add(proc_size as usize)
        .filter(|end| *end <= bytecode.len())
        .ok_or_else(|| RuntimeError::invariant("invalid proc header"))?;
    if (proc_size as usize) < PROC_COUNTS_LEN {
        return Err(RuntimeError::invariant("invalid proc header"));
    }

    let num_arguments = read_u16(bytecode, counts_at);
    let num_locals = read_u16(bytecode, counts_at + 2);
    let num_lexicals = read_u16(bytecode, counts_at + 4);

    let table_at = counts_at + PROC_COUNTS_LEN;
    let body_at = table_at + LEXICAL_RECORD_LEN * num_lexicals as usize;
    if body_at > proc_end {
        return Err(RuntimeError::invariant("invalid proc header"));
    }

    let mut lexicals = Vec::with_capacity(num_lexicals as usize);
    for at in (table_at..body_at).step_by(LEXICAL_RECORD_LEN) {
        let target = LexicalTarget::from_u8(bytecode[at + 8]).ok_or_else(|| {
            RuntimeError::invariant(format!("invalid lexical target at offset {at}"))
        })?;
        lexicals.push(ProcLexical {
            activation_call: read_u32(bytecode, at),
            target_offset: read_u32(bytecode, at + 4),
            target,
        });
    }

    Ok(ProcInfo {
        proc_offset,
        proc_size,
        num_arguments,
        num_locals,
        lexicals,
        body_offset: body_at as u32,
        body_len: (proc_end - body_at) as u32,
    })
}
