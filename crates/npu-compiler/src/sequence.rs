//! Bounded, growable instruction sequences

use std::fmt;
use std::ops::Deref;

use npu_chip::Instruction;

use crate::error::{CompileError, Result};

/// Instruction list that refuses to grow past a fixed bound.
///
/// Pushing past the bound is an error; nothing is ever truncated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionSequence {
    insts: Vec<Instruction>,
    bound: usize,
}

impl InstructionSequence {
    /// Empty sequence holding at most `bound` instructions
    #[must_use]
    pub fn with_bound(bound: usize) -> Self {
        Self {
            insts: Vec::with_capacity(bound.min(256)),
            bound,
        }
    }

    /// Wrap existing instructions, checking the bound.
    ///
    /// # Errors
    ///
    /// Returns [`CompileError::SequenceOverflow`] if `insts` is longer than `bound`.
    pub fn from_instructions(insts: Vec<Instruction>, bound: usize) -> Result<Self> {
        if insts.len() > bound {
            return Err(CompileError::SequenceOverflow { bound });
        }
        Ok(Self { insts, bound })
    }

    /// Append one instruction.
    ///
    /// # Errors
    ///
    /// Returns [`CompileError::SequenceOverflow`] if the sequence is full.
    pub fn push(&mut self, inst: Instruction) -> Result<()> {
        if self.insts.len() >= self.bound {
            return Err(CompileError::SequenceOverflow { bound: self.bound });
        }
        self.insts.push(inst);
        Ok(())
    }

    /// Configured bound
    pub const fn bound(&self) -> usize {
        self.bound
    }

    /// Instructions as a slice
    pub fn as_slice(&self) -> &[Instruction] {
        &self.insts
    }

    /// Raw words, in order
    pub fn words(&self) -> impl Iterator<Item = u64> + '_ {
        self.insts.iter().map(|inst| inst.word())
    }

    /// Little-endian byte image, 8 bytes per instruction
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.words().flat_map(u64::to_le_bytes).collect()
    }

    /// Disassembly listing, one line per instruction
    pub fn listing(&self) -> String {
        self.to_string()
    }

    /// Take the instructions out
    pub fn into_vec(self) -> Vec<Instruction> {
        self.insts
    }
}

impl Deref for InstructionSequence {
    type Target = [Instruction];

    fn deref(&self) -> &Self::Target {
        &self.insts
    }
}

impl<'a> IntoIterator for &'a InstructionSequence {
    type Item = &'a Instruction;
    type IntoIter = std::slice::Iter<'a, Instruction>;

    fn into_iter(self) -> Self::IntoIter {
        self.insts.iter()
    }
}

impl fmt::Display for InstructionSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, inst) in self.insts.iter().enumerate() {
            writeln!(f, "{i:4}: {inst}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_past_bound_is_an_error() {
        let mut seq = InstructionSequence::with_bound(2);
        seq.push(Instruction::nop()).unwrap();
        seq.push(Instruction::halt()).unwrap();
        assert_eq!(
            seq.push(Instruction::nop()),
            Err(CompileError::SequenceOverflow { bound: 2 })
        );
        assert_eq!(seq.len(), 2);
    }

    #[test]
    fn from_instructions_checks_bound() {
        let insts = vec![Instruction::nop(); 3];
        assert!(InstructionSequence::from_instructions(insts.clone(), 2).is_err());
        assert_eq!(InstructionSequence::from_instructions(insts, 3).unwrap().len(), 3);
    }

    #[test]
    fn byte_image_is_little_endian() {
        let seq = InstructionSequence::from_instructions(vec![Instruction::halt()], 1).unwrap();
        assert_eq!(seq.to_le_bytes(), vec![0, 0, 0, 0, 0, 0, 0x01, 0x01]);
    }

    #[test]
    fn listing_numbers_lines() {
        let seq =
            InstructionSequence::from_instructions(vec![Instruction::clear_acc(), Instruction::halt()], 4)
                .unwrap();
        let text = seq.listing();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("   0: CLEAR_ACC"));
        assert!(lines[1].starts_with("   1: HALT"));
    }
}
