use std::fmt;

use crate::Value;

/// Byte offset of the next instruction within the current segment, or
/// nothing when there is no continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InstructionPointer(Option<u32>);

impl InstructionPointer {
    pub const INVALID: InstructionPointer = InstructionPointer(None);

    #[must_use]
    pub const fn at(offset: u32) -> Self {
        Self(Some(offset))
    }

    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0.is_some()
    }

    #[inline]
    #[must_use]
    pub const fn offset(self) -> Option<u32> {
        self.0
    }

    /// Moves `n` bytes forward; running past `u32::MAX` leaves no
    /// continuation.
    #[must_use]
    pub fn advanced(self, n: u32) -> Self {
        Self(self.0.and_then(|offset| offset.checked_add(n)))
    }
}

impl fmt::Display for InstructionPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(offset) => write!(f, "{offset}"),
            None => f.write_str("<none>"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallFrameInfo {
    pub call_index: u32,
    pub call_segment: u32,
    pub proc_offset: u32,
    pub return_segment: Option<u32>,
    pub return_ip: InstructionPointer,
    /// Value stack depth at call time.
    pub stack_guard: usize,
    pub num_arguments: u16,
    pub num_locals: u16,
    pub num_lexicals: u16,
}

/// One in-flight call.
///
/// Slots are laid out as arguments, rest arguments, locals, lexicals.
#[derive(Debug, Clone)]
pub struct CallFrame {
    info: CallFrameInfo,
    num_rest: u16,
    slots: Vec<Value>,
    receiver: Option<Value>,
}

impl CallFrame {
    /// `arguments` must hold at least `info.num_arguments` values and at most
    /// `u16::MAX`; anything past the declared arity becomes rest arguments.
    #[must_use]
    pub fn new(info: CallFrameInfo, arguments: Vec<Value>, receiver: Option<Value>) -> Self {
        debug_assert!(arguments.len() >= info.num_arguments as usize);
        debug_assert!(arguments.len() <= u16::MAX as usize);
        let num_rest = (arguments.len() - info.num_arguments as usize) as u16;

        let mut slots = arguments;
        let len = slots.len() + info.num_locals as usize + info.num_lexicals as usize;
        slots.resize(len, Value::Invalid);
        Self { info, num_rest, slots, receiver }
    }

    #[must_use]
    pub fn info(&self) -> &CallFrameInfo {
        &self.info
    }

    #[must_use]
    pub fn call_index(&self) -> u32 {
        self.info.call_index
    }

    #[must_use]
    pub fn call_segment(&self) -> u32 {
        self.info.call_segment
    }

    #[must_use]
    pub fn proc_offset(&self) -> u32 {
        self.info.proc_offset
    }

    #[must_use]
    pub fn return_segment(&self) -> Option<u32> {
        self.info.return_segment
    }

    #[must_use]
    pub fn return_ip(&self) -> InstructionPointer {
        self.info.return_ip
    }

    #[must_use]
    pub fn stack_guard(&self) -> usize {
        self.info.stack_guard
    }

    #[must_use]
    pub fn num_arguments(&self) -> u16 {
        self.info.num_arguments
    }

    #[must_use]
    pub fn num_rest(&self) -> u16 {
        self.num_rest
    }

    #[must_use]
    pub fn num_locals(&self) -> u16 {
        self.info.num_locals
    }

    #[must_use]
    pub fn num_lexicals(&self) -> u16 {
        self.info.num_lexicals
    }

    #[must_use]
    pub fn receiver(&self) -> Option<Value> {
        self.receiver
    }

    fn rest_base(&self) -> usize {
        self.info.num_arguments as usize
    }

    fn locals_base(&self) -> usize {
        self.rest_base() + self.num_rest as usize
    }

    fn lexicals_base(&self) -> usize {
        self.locals_base() + self.info.num_locals as usize
    }

    fn get(&self, base: usize, len: u16, i: u32) -> Value {
        if i < u32::from(len) {
            self.slots[base + i as usize]
        } else {
            Value::Invalid
        }
    }

    fn set(&mut self, base: usize, len: u16, i: u32, value: Value) -> bool {
        if i < u32::from(len) {
            self.slots[base + i as usize] = value;
            true
        } else {
            false
        }
    }

    /// [`Value::Invalid`] when `i` is out of range, likewise for the other getters.
    #[must_use]
    pub fn get_argument(&self, i: u32) -> Value {
        self.get(0, self.info.num_arguments, i)
    }

    pub fn set_argument(&mut self, i: u32, value: Value) -> bool {
        self.set(0, self.info.num_arguments, i, value)
    }

    #[must_use]
    pub fn get_rest(&self, i: u32) -> Value {
        self.get(self.rest_base(), self.num_rest, i)
    }

    #[must_use]
    pub fn rest(&self) -> &[Value] {
        &self.slots[self.rest_base()..self.locals_base()]
    }

    #[must_use]
    pub fn get_local(&self, i: u32) -> Value {
        self.get(self.locals_base(), self.info.num_locals, i)
    }

    pub fn set_local(&mut self, i: u32, value: Value) -> bool {
        self.set(self.locals_base(), self.info.num_locals, i, value)
    }

    #[must_use]
    pub fn get_lexical(&self, i: u32) -> Value {
        self.get(self.lexicals_base(), self.info.num_lexicals, i)
    }

    pub fn set_lexical(&mut self, i: u32, value: Value) -> bool {
        self.set(self.lexicals_base(), self.info.num_lexicals, i, value)
    }

    /// Every slot and the receiver, for root scanning.
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut Value> {
        self.slots.iter_mut().chain(self.receiver.iter_mut())
    }
}

impl fmt::Display for CallFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CallFrame(segment={}, call={} offset={}, receiver=",
            self.info.call_segment, self.info.call_index, self.info.proc_offset
        )?;
        match self.receiver {
            Some(receiver) => write!(f, "{receiver})"),
            None => f.write_str("none)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(num_arguments: u16, num_locals: u16, num_lexicals: u16) -> CallFrameInfo {
        CallFrameInfo {
            call_index: 1,
            call_segment: 0,
            proc_offset: 12,
            return_segment: Some(0),
            return_ip: InstructionPointer::at(4),
            stack_guard: 0,
            num_arguments,
            num_locals,
            num_lexicals,
        }
    }

    #[test]
    fn instruction_pointer_overflow_ends_execution() {
        let ip = InstructionPointer::at(u32::MAX - 1);
        assert_eq!(ip.advanced(1), InstructionPointer::at(u32::MAX));
        assert_eq!(ip.advanced(2), InstructionPointer::INVALID);
        assert_eq!(InstructionPointer::INVALID.advanced(1), InstructionPointer::INVALID);
    }

    #[test]
    fn extra_arguments_become_rest() {
        let args = vec![Value::I64(1), Value::I64(2), Value::I64(3)];
        let frame = CallFrame::new(info(1, 2, 1), args, None);
        assert_eq!(frame.num_rest(), 2);
        assert_eq!(frame.get_argument(0), Value::I64(1));
        assert_eq!(frame.rest(), &[Value::I64(2), Value::I64(3)]);
        assert_eq!(frame.get_rest(1), Value::I64(3));
        assert!(!frame.get_rest(2).is_valid());
        assert!(!frame.get_local(0).is_valid());
    }

    #[test]
    fn slots_are_bounds_checked() {
        let mut frame = CallFrame::new(info(1, 1, 1), vec![Value::Nil], None);
        assert!(frame.set_local(0, Value::Bool(true)));
        assert!(!frame.set_local(1, Value::Bool(true)));
        assert!(frame.set_lexical(0, Value::I64(9)));
        assert!(!frame.set_argument(1, Value::Nil));

        assert_eq!(frame.get_local(0), Value::Bool(true));
        assert_eq!(frame.get_lexical(0), Value::I64(9));
        assert!(!frame.get_argument(5).is_valid());
        assert!(!frame.get_lexical(1).is_valid());
    }

    #[test]
    fn display_names_linkage_and_receiver() {
        let mut frame = CallFrame::new(info(0, 0, 0), Vec::new(), Some(Value::I64(3)));
        assert_eq!(frame.to_string(), "CallFrame(segment=0, call=1 offset=12, receiver=3)");
        assert_eq!(frame.values_mut().count(), 1);
    }
}
