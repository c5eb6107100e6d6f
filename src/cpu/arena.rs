use crate::cpu::operand::Operand;
use crate::error::Error;

#[cfg(test)]
#[path = "./arena_test.rs"]
mod arena_test;

/// no instruction needs more live operands than this, including the
/// implicit stack and string operands created by handlers
pub const MAX_OPERANDS: usize = 8;

/// handle to an operand owned by an `OperandArena`
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OperandId {
    index: u8,
    generation: u32,
}

impl OperandId {
    pub fn index(self) -> usize {
        self.index as usize
    }
}

/// Bump allocator for the operands of one emulated instruction.
///
/// There is no individual release, `reset()` frees everything at once and
/// invalidates all ids handed out before it.
pub struct OperandArena {
    slots: Vec<Operand>,
    generation: u32,
}

impl Default for OperandArena {
    fn default() -> Self {
        OperandArena::new()
    }
}

impl OperandArena {
    pub fn new() -> Self {
        OperandArena {
            slots: Vec::with_capacity(MAX_OPERANDS),
            generation: 0,
        }
    }

    pub fn alloc(&mut self, op: Operand) -> Result<OperandId, Error> {
        if self.slots.len() >= MAX_OPERANDS {
            return Err(Error::ArenaFull);
        }
        self.slots.push(op);
        Ok(OperandId {
            index: (self.slots.len() - 1) as u8,
            generation: self.generation,
        })
    }

    pub fn reset(&mut self) {
        self.slots.clear();
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn get(&self, id: OperandId) -> Result<&Operand, Error> {
        if id.generation != self.generation {
            return Err(Error::StaleOperand);
        }
        self.slots.get(id.index()).ok_or(Error::StaleOperand)
    }

    pub fn get_mut(&mut self, id: OperandId) -> Result<&mut Operand, Error> {
        if id.generation != self.generation {
            return Err(Error::StaleOperand);
        }
        self.slots.get_mut(id.index()).ok_or(Error::StaleOperand)
    }
}
