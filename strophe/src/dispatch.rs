use crate::{
    Address, CallFrame, CallFrameInfo, Descriptor, Fiber, HeapManager, InstructionPointer,
    LexicalTarget, LinkageSection, ProcLexical, Result, RuntimeError, SegmentManager, Value,
    VirtualMethod, parse_proc_info,
};

/// Outcome of a successful return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnOutcome {
    /// Control went back to a caller.
    Resume,
    /// The outermost frame returned, the program is done.
    Complete,
}

impl ReturnOutcome {
    #[must_use]
    pub fn should_continue(self) -> bool {
        matches!(self, ReturnOutcome::Resume)
    }
}

struct CallTarget {
    segment: u32,
    call_index: u32,
    proc_offset: u32,
    receiver: Option<Value>,
}

impl CallTarget {
    fn bound(method: VirtualMethod, receiver: Value) -> Self {
        Self {
            segment: method.segment,
            call_index: method.call_index,
            proc_offset: method.proc_offset,
            receiver: Some(receiver),
        }
    }
}

fn current_segment(fiber: &Fiber) -> Result<u32> {
    fiber
        .peek_sp()
        .ok_or_else(|| RuntimeError::invariant("no current segment"))
}

/// Sets up and tears down call frames for every call protocol.
///
/// The instruction dispatch loop is expected to have moved the instruction
/// pointer past the calling instruction; that position becomes the return
/// address. A failing call leaves the fiber untouched.
#[derive(Debug, Clone, Default)]
pub struct CallDispatcher {
    trace_frames: bool,
}

impl CallDispatcher {
    #[must_use]
    pub fn new(trace_frames: bool) -> Self {
        Self { trace_frames }
    }

    fn enter(
        &self,
        segments: &SegmentManager,
        fiber: &mut Fiber,
        target: CallTarget,
        arguments: Vec<Value>,
    ) -> Result<()> {
        let segment = segments
            .get_segment(target.segment)
            .ok_or_else(|| RuntimeError::invariant(format!("invalid segment {}", target.segment)))?;
        let proc = parse_proc_info(segment.bytecode(), target.proc_offset)?;

        if arguments.len() > u16::MAX as usize {
            return Err(RuntimeError::invariant("too many arguments"));
        }
        if arguments.len() < proc.num_arguments as usize {
            return Err(RuntimeError::invariant("not enough arguments"));
        }

        let info = CallFrameInfo {
            call_index: target.call_index,
            call_segment: target.segment,
            proc_offset: target.proc_offset,
            return_segment: fiber.peek_sp(),
            return_ip: fiber.peek_ip(),
            stack_guard: fiber.data_stack_size(),
            num_arguments: proc.num_arguments,
            num_locals: proc.num_locals,
            num_lexicals: proc.num_lexicals(),
        };
        let mut frame = CallFrame::new(info, arguments, target.receiver);
        import_lexicals(fiber, &mut frame, target.segment, &proc.lexicals)?;

        let ip = InstructionPointer::at(proc.body_offset);
        if self.trace_frames {
            log::debug!("entering {frame} at ip {ip}");
        } else {
            let (call, segment) = (target.call_index, target.segment);
            log::trace!("call {call} in segment {segment} moves ip to {ip}");
        }
        fiber.push_call(frame, ip, target.segment);
        Ok(())
    }

    /// Calls the procedure at `proc_offset` of `segment` directly.
    pub fn call_proc(
        &self,
        segments: &SegmentManager,
        fiber: &mut Fiber,
        segment: u32,
        call_index: u32,
        proc_offset: u32,
        arguments: Vec<Value>,
    ) -> Result<()> {
        let target = CallTarget { segment, call_index, proc_offset, receiver: None };
        self.enter(segments, fiber, target, arguments)
    }

    /// Calls a free procedure by near or far address.
    pub fn call_static(
        &self,
        segments: &mut SegmentManager,
        fiber: &mut Fiber,
        address: Address,
        arguments: Vec<Value>,
    ) -> Result<()> {
        let current = current_segment(fiber)?;
        let call = if address.is_near() {
            Descriptor::new(current, address.offset())
        } else if address.is_far() {
            let entry = segments.resolve_link(current, address.offset())?;
            if entry.section != LinkageSection::Call {
                return Err(RuntimeError::invariant("invalid call linkage"));
            }
            entry.descriptor()
        } else {
            return Err(RuntimeError::invariant("missing call"));
        };
        self.call_static_descriptor(segments, fiber, Value::Call(call), arguments)
    }

    /// Like [`Self::call_static`] with the call descriptor already resolved.
    pub fn call_static_descriptor(
        &self,
        segments: &SegmentManager,
        fiber: &mut Fiber,
        descriptor: Value,
        arguments: Vec<Value>,
    ) -> Result<()> {
        let Value::Call(call) = descriptor else {
            return Err(RuntimeError::invariant(format!("invalid call descriptor {descriptor}")));
        };
        let descriptor = segments
            .get_segment(call.segment)
            .and_then(|segment| segment.object().call(call.index))
            .ok_or_else(|| RuntimeError::invariant("missing call"))?;
        if descriptor.is_bound() || descriptor.is_constructor() {
            return Err(RuntimeError::invariant("invalid call flags"));
        }
        let target = CallTarget {
            segment: call.segment,
            call_index: call.index,
            proc_offset: descriptor.proc_offset,
            receiver: None,
        };
        self.enter(segments, fiber, target, arguments)
    }

    /// Calls the receiver's implementation of the method at `address`.
    pub fn call_virtual(
        &self,
        segments: &mut SegmentManager,
        heap: &HeapManager,
        fiber: &mut Fiber,
        receiver: Value,
        address: Address,
        arguments: Vec<Value>,
    ) -> Result<()> {
        let current = current_segment(fiber)?;
        let method = resolve_descriptor(segments, current, LinkageSection::Call, address)?;
        let method = heap
            .lookup_method(receiver, method)?
            .ok_or_else(|| RuntimeError::invariant("missing virtual method"))?;
        self.enter(segments, fiber, CallTarget::bound(method, receiver), arguments)
    }

    /// Calls the receiver's extension for `action` of `concept`.
    #[allow(clippy::too_many_arguments)]
    pub fn call_concept(
        &self,
        segments: &mut SegmentManager,
        heap: &HeapManager,
        fiber: &mut Fiber,
        receiver: Value,
        concept: Value,
        action: Address,
        arguments: Vec<Value>,
    ) -> Result<()> {
        let Value::Concept(concept) = concept else {
            return Err(RuntimeError::invariant(format!("invalid concept descriptor {concept}")));
        };
        let current = current_segment(fiber)?;
        let action = resolve_descriptor(segments, current, LinkageSection::Action, action)?;
        let method = heap
            .lookup_extension(receiver, concept, action)?
            .ok_or_else(|| RuntimeError::invariant("missing extension method"))?;
        self.enter(segments, fiber, CallTarget::bound(method, receiver), arguments)
    }

    /// Calls a method of `existential` with `receiver` bound, used for
    /// receivers that carry no table of their own.
    pub fn call_existential(
        &self,
        segments: &mut SegmentManager,
        fiber: &mut Fiber,
        receiver: Value,
        existential: Value,
        address: Address,
        arguments: Vec<Value>,
    ) -> Result<()> {
        let current = current_segment(fiber)?;
        let table = segments.resolve_existential_table(existential)?;
        let method = resolve_descriptor(segments, current, LinkageSection::Call, address)?;
        let method = table
            .get_method(method)
            .ok_or_else(|| RuntimeError::invariant("missing method"))?;
        self.enter(segments, fiber, CallTarget::bound(method, receiver), arguments)
    }

    /// Enters the initializer of the static at `address`.
    pub fn init_static(
        &self,
        segments: &mut SegmentManager,
        fiber: &mut Fiber,
        address: Address,
    ) -> Result<()> {
        let current = current_segment(fiber)?;
        let target = segments.resolve_static(current, address)?;
        let object = segments
            .get_segment(target.segment)
            .map(|segment| segment.object().clone())
            .ok_or_else(|| RuntimeError::invariant("missing static symbol"))?;
        let initializer = object
            .static_descriptor(target.index)
            .ok_or_else(|| RuntimeError::invariant("missing static symbol"))?
            .initializer;
        if !initializer.is_near() {
            return Err(RuntimeError::invariant("invalid static init"));
        }
        let call = object
            .call(initializer.offset())
            .ok_or_else(|| RuntimeError::invariant("invalid static init"))?;
        self.call_proc(
            segments,
            fiber,
            target.segment,
            initializer.offset(),
            call.proc_offset,
            Vec::new(),
        )
    }

    /// Pops the innermost frame and hands control back to its caller. Of the
    /// values the callee left above its stack guard only the topmost survives.
    pub fn return_to_caller(&self, fiber: &mut Fiber) -> Result<ReturnOutcome> {
        let frame = fiber
            .pop_call()
            .ok_or_else(|| RuntimeError::invariant("call stack is empty"))?;
        fiber.transfer_control(frame.return_ip(), frame.return_segment());

        let guard = frame.stack_guard();
        if fiber.data_stack_size() > guard {
            let result = fiber.pop_data()?;
            fiber.resize_data_stack(guard)?;
            fiber.push_data(result);
        }

        if self.trace_frames {
            log::debug!("leaving {frame}, ip now {}", fiber.peek_ip());
        }
        if fiber.peek_ip().is_valid() {
            Ok(ReturnOutcome::Resume)
        } else {
            Ok(ReturnOutcome::Complete)
        }
    }
}

fn resolve_descriptor(
    segments: &mut SegmentManager,
    segment: u32,
    section: LinkageSection,
    address: Address,
) -> Result<Descriptor> {
    segments
        .resolve_descriptor(segment, section, address)?
        .descriptor()
        .ok_or_else(|| RuntimeError::invariant(format!("invalid {section} descriptor")))
}

fn import_lexicals(
    fiber: &Fiber,
    frame: &mut CallFrame,
    segment: u32,
    lexicals: &[ProcLexical],
) -> Result<()> {
    for (i, lexical) in lexicals.iter().enumerate() {
        let ancestor = fiber
            .calls()
            .find(|ancestor| {
                ancestor.call_segment() == segment
                    && ancestor.call_index() == lexical.activation_call
            })
            .ok_or_else(|| RuntimeError::invariant("missing lexical"))?;

        let (value, len) = match lexical.target {
            LexicalTarget::Argument => {
                (ancestor.get_argument(lexical.target_offset), ancestor.num_arguments())
            }
            LexicalTarget::Local => {
                (ancestor.get_local(lexical.target_offset), ancestor.num_locals())
            }
        };
        if lexical.target_offset >= u32::from(len) {
            return Err(RuntimeError::invariant(format!(
                "invalid lexical target at offset {}",
                lexical.target_offset
            )));
        }
        frame.set_lexical(i as u32, value);
    }
    Ok(())
}
