use crate::{CallFrame, InstructionPointer, Result, RootProvider, RuntimeError, Value};

#[derive(Debug, Clone)]
pub struct FiberCreateInfo {
    pub data_stack_size: usize,
    pub call_stack_size: usize,
}

impl Default for FiberCreateInfo {
    fn default() -> Self {
        Self {
            data_stack_size: 1024,
            call_stack_size: 128,
        }
    }
}

/// An execution context: one call stack, one value stack and the current
/// instruction pointer and segment.
#[derive(Debug)]
pub struct Fiber {
    ip: InstructionPointer,
    sp: Option<u32>,
    calls: Vec<CallFrame>,
    data: Vec<Value>,
    // call stack depths recorded for unwinding
    guards: Vec<usize>,
}

impl Fiber {
    #[must_use]
    pub fn new(info: &FiberCreateInfo) -> Self {
        Self {
            ip: InstructionPointer::INVALID,
            sp: None,
            calls: Vec::with_capacity(info.call_stack_size),
            data: Vec::with_capacity(info.data_stack_size),
            guards: Vec::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn peek_ip(&self) -> InstructionPointer {
        self.ip
    }

    /// Index of the current code segment.
    #[inline]
    #[must_use]
    pub fn peek_sp(&self) -> Option<u32> {
        self.sp
    }

    /// Moves execution to `ip`, switching segments when `sp` is given.
    pub fn transfer_control(&mut self, ip: InstructionPointer, sp: Option<u32>) {
        self.ip = ip;
        if sp.is_some() {
            self.sp = sp;
        }
    }

    pub fn advance_ip(&mut self, n: u32) {
        self.ip = self.ip.advanced(n);
    }

    pub fn push_call(&mut self, frame: CallFrame, ip: InstructionPointer, sp: u32) {
        self.ip = ip;
        self.sp = Some(sp);
        self.calls.push(frame);
    }

    pub fn pop_call(&mut self) -> Option<CallFrame> {
        self.calls.pop()
    }

    pub fn drop_call(&mut self) -> bool {
        self.calls.pop().is_some()
    }

    /// `depth` 0 is the innermost frame.
    #[must_use]
    pub fn peek_call(&self, depth: usize) -> Option<&CallFrame> {
        self.calls.iter().rev().nth(depth)
    }

    #[must_use]
    pub fn current_call(&self) -> Option<&CallFrame> {
        self.calls.last()
    }

    pub fn current_call_mut(&mut self) -> Option<&mut CallFrame> {
        self.calls.last_mut()
    }

    /// Frames from innermost to outermost.
    pub fn calls(&self) -> impl DoubleEndedIterator<Item = &CallFrame> + ExactSizeIterator {
        self.calls.iter().rev()
    }

    #[must_use]
    pub fn call_depth(&self) -> usize {
        self.calls.len()
    }

    fn data_floor(&self) -> usize {
        self.calls.last().map_or(0, CallFrame::stack_guard)
    }

    pub fn push_data(&mut self, value: Value) {
        self.data.push(value);
    }

    pub fn extend_data_stack(&mut self, values: impl IntoIterator<Item = Value>) {
        self.data.extend(values);
    }

    pub fn pop_data(&mut self) -> Result<Value> {
        if self.data.is_empty() {
            return Err(RuntimeError::invariant("data stack is empty"));
        }
        if self.data.len() <= self.data_floor() {
            return Err(RuntimeError::invariant("data stack guard violated"));
        }
        self.data.pop().ok_or_else(|| RuntimeError::invariant("data stack is empty"))
    }

    /// Pops the top `n` values, returned bottom first.
    pub fn pop_data_n(&mut self, n: usize) -> Result<Vec<Value>> {
        if n > self.data.len() {
            return Err(RuntimeError::invariant("data stack is empty"));
        }
        let at = self.data.len() - n;
        if at < self.data_floor() {
            return Err(RuntimeError::invariant("data stack guard violated"));
        }
        Ok(self.data.split_off(at))
    }

    pub fn drop_data(&mut self) -> Result<()> {
        self.pop_data().map(|_| ())
    }

    /// `offset` 0 is the top of the stack.
    #[must_use]
    pub fn peek_data(&self, offset: usize) -> Option<Value> {
        self.data.iter().rev().nth(offset).copied()
    }

    #[must_use]
    pub fn data_stack(&self) -> &[Value] {
        &self.data
    }

    #[must_use]
    pub fn data_stack_size(&self) -> usize {
        self.data.len()
    }

    /// Truncates to `n` values, or pads with [`Value::Invalid`] when growing.
    pub fn resize_data_stack(&mut self, n: usize) -> Result<()> {
        if n < self.data_floor() {
            return Err(RuntimeError::invariant("data stack guard violated"));
        }
        self.data.resize(n, Value::Invalid);
        Ok(())
    }

    pub fn push_guard(&mut self) {
        self.guards.push(self.calls.len());
    }

    pub fn pop_guard(&mut self) -> Option<usize> {
        self.guards.pop()
    }

    #[must_use]
    pub fn peek_guard(&self) -> Option<usize> {
        self.guards.last().copied()
    }

    /// True when the call stack is back at the depth of the innermost guard.
    #[must_use]
    pub fn check_guard(&self) -> bool {
        self.peek_guard() == Some(self.calls.len())
    }

    pub fn reset(&mut self) {
        self.ip = InstructionPointer::INVALID;
        self.sp = None;
        self.calls.clear();
        self.data.clear();
        self.guards.clear();
    }
}

impl RootProvider for Fiber {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for value in &mut self.data {
            visitor(value);
        }
        for frame in &mut self.calls {
            for value in frame.values_mut() {
                visitor(value);
            }
        }
    }
}
