use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{
    Address, ArenaHeap, CallDispatcher, CollectionStats, EventLoop, Fiber, FiberCreateInfo,
    HeapCreateInfo, HeapManager, LinkageSection, ModuleLoader, ModuleLocation, PreludeTables,
    Result, ReturnOutcome, RootHandle, RootProvider, RuntimeError, Scheduler, SegmentManager,
    SharedHeap, StatusCode, SymbolPath, TypeManager, Value, parse_proc_info,
};

pub struct VMCreateInfo {
    pub loader: Arc<dyn ModuleLoader>,
    /// Heap to allocate from; a fresh [`ArenaHeap`] when absent.
    pub heap: Option<SharedHeap>,
    /// Skips bootstrap detection when set.
    pub prelude_location: Option<ModuleLocation>,
    pub heap_info: HeapCreateInfo,
    pub fiber_info: FiberCreateInfo,
    pub trace_frames: bool,
}

impl VMCreateInfo {
    #[must_use]
    pub fn new(loader: Arc<dyn ModuleLoader>) -> Self {
        Self {
            loader,
            heap: None,
            prelude_location: None,
            heap_info: HeapCreateInfo::default(),
            fiber_info: FiberCreateInfo::default(),
            trace_frames: false,
        }
    }
}

fn check_main_location(location: &ModuleLocation) -> Result<()> {
    if location.is_valid() && location.is_absolute() {
        Ok(())
    } else {
        Err(RuntimeError::invariant("invalid main location"))
    }
}

/// Finds the single system bootstrap import of the main module.
fn detect_bootstrap(
    segments: &mut SegmentManager,
    main: &ModuleLocation,
) -> Result<ModuleLocation> {
    let index = segments.get_or_load_segment(main)?;
    let object = segments
        .get_segment(index)
        .map(|segment| segment.object().clone())
        .ok_or_else(|| RuntimeError::MissingObject(main.to_string()))?;

    let mut bootstrap = None;
    for import in object.imports().iter().filter(|import| import.system_bootstrap) {
        if bootstrap.is_some() {
            return Err(RuntimeError::invariant("duplicate system bootstrap detected"));
        }
        bootstrap = Some(import.location.clone());
    }
    let bootstrap =
        bootstrap.ok_or_else(|| RuntimeError::invariant("missing system bootstrap import"))?;
    log::debug!("detected system bootstrap {bootstrap} for {main}");
    Ok(bootstrap)
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}

struct VmRoots<'a> {
    scheduler: &'a mut Scheduler,
    segments: &'a mut SegmentManager,
    arguments: &'a mut [Value],
}

impl RootProvider for VmRoots<'_> {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        self.scheduler.visit_roots(visitor);
        self.segments.visit_roots(visitor);
        for value in self.arguments.iter_mut() {
            visitor(value);
        }
    }
}

/// One virtual machine instance.
///
/// Fields drop in declaration order, which is the reverse of the order
/// `create` builds them in.
#[derive(Debug)]
pub struct VM {
    heap_manager: HeapManager,
    scheduler: Scheduler,
    dispatcher: CallDispatcher,
    types: TypeManager,
    segments: SegmentManager,
    prelude_location: ModuleLocation,
    main_location: Option<ModuleLocation>,
    main_arguments: Vec<Value>,
    argument_handles: Vec<RootHandle>,
    load_epoch_millis: u64,
    status: StatusCode,
    active: bool,
}

impl VM {
    /// Builds a VM and, when `main_location` is given, loads it.
    ///
    /// On failure every subsystem built so far is released before the error
    /// is returned.
    pub fn create(info: VMCreateInfo, main_location: Option<ModuleLocation>) -> Result<Self> {
        if let Some(main) = &main_location {
            check_main_location(main)?;
        }

        let heap = info
            .heap
            .unwrap_or_else(|| ArenaHeap::shared(info.heap_info.clone()));
        let event_loop = EventLoop::new();
        let mut segments = SegmentManager::new(info.loader);

        let prelude_location = match (info.prelude_location, &main_location) {
            (Some(prelude), _) => prelude,
            (None, Some(main)) => detect_bootstrap(&mut segments, main)?,
            (None, None) => {
                return Err(RuntimeError::invariant(
                    "either main location or prelude location must be specified",
                ));
            }
        };
        let prelude = segments.get_or_load_segment(&prelude_location)?;

        let types = TypeManager::create(&mut segments, prelude)?;
        let tables = PreludeTables::resolve(&mut segments, prelude)?;
        let dispatcher = CallDispatcher::new(info.trace_frames);
        let scheduler = Scheduler::new(event_loop, info.fiber_info);
        let heap_manager = HeapManager::new(heap, tables);
        log::debug!("vm created with prelude {prelude_location}");

        let mut vm = VM {
            heap_manager,
            scheduler,
            dispatcher,
            types,
            segments,
            prelude_location,
            main_location: None,
            main_arguments: Vec::new(),
            argument_handles: Vec::new(),
            load_epoch_millis: 0,
            status: StatusCode::Unknown,
            active: false,
        };
        if let Some(main) = main_location {
            vm.reload(main)?;
        }
        Ok(vm)
    }

    pub fn reload(&mut self, main_location: ModuleLocation) -> Result<()> {
        self.reload_with_arguments(main_location, &[])
    }

    /// Re-arms the main task with the entry point of `main_location`. Heap,
    /// loaded segments and prelude tables are kept.
    pub fn reload_with_arguments(
        &mut self,
        main_location: ModuleLocation,
        arguments: &[&str],
    ) -> Result<()> {
        check_main_location(&main_location)?;
        let segment = self.segments.get_or_load_segment(&main_location)?;
        self.segments.set_origin(main_location.parent());

        let object = self
            .segments
            .get_segment(segment)
            .map(|segment| segment.object().clone())
            .ok_or_else(|| RuntimeError::MissingObject(main_location.to_string()))?;
        let entry = SymbolPath::entry();
        let symbol = object
            .find_symbol(&entry)
            .ok_or_else(|| RuntimeError::MissingSymbol(entry.to_string()))?;
        if symbol.section != LinkageSection::Call {
            return Err(RuntimeError::invariant("entry symbol must be a CALL"));
        }
        let call = object
            .call(symbol.index)
            .ok_or_else(|| RuntimeError::invariant("invalid entry symbol"))?;
        let proc = parse_proc_info(object.bytecode(), call.proc_offset)?;
        if proc.num_arguments != 0 || proc.num_lexicals() != 0 {
            return Err(RuntimeError::invariant("invalid proc header"));
        }

        let fiber = self
            .scheduler
            .main_fiber_mut()
            .ok_or_else(|| RuntimeError::invariant("missing main task"))?;
        fiber.reset();
        self.dispatcher.call_proc(
            &self.segments,
            fiber,
            segment,
            symbol.index,
            call.proc_offset,
            Vec::new(),
        )?;
        self.scheduler.rearm_main();
        self.scheduler.select_next_ready();

        for handle in self.argument_handles.drain(..) {
            self.heap_manager.release_handle(handle);
        }
        self.main_arguments = arguments
            .iter()
            .map(|argument| self.heap_manager.allocate_string(argument))
            .collect();
        self.argument_handles = self
            .main_arguments
            .iter()
            .filter_map(|argument| self.heap_manager.create_handle(*argument))
            .collect();

        self.main_location = Some(main_location);
        self.load_epoch_millis = epoch_millis();
        self.status = StatusCode::Unknown;
        self.active = true;
        log::debug!("loaded entry of segment {segment}");
        Ok(())
    }

    pub fn halt(&mut self, status: StatusCode) -> Result<()> {
        if !self.active {
            return Err(RuntimeError::invariant("cannot halt inactive interpreter"));
        }
        self.status = status;
        self.active = false;
        log::debug!("halted with status {status}");
        Ok(())
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub fn load_epoch_millis(&self) -> u64 {
        self.load_epoch_millis
    }

    #[must_use]
    pub fn main_location(&self) -> Option<&ModuleLocation> {
        self.main_location.as_ref()
    }

    #[must_use]
    pub fn prelude_location(&self) -> &ModuleLocation {
        &self.prelude_location
    }

    #[must_use]
    pub fn num_main_arguments(&self) -> usize {
        self.main_arguments.len()
    }

    #[must_use]
    pub fn main_argument(&self, i: usize) -> Value {
        self.main_arguments.get(i).copied().unwrap_or(Value::Invalid)
    }

    #[must_use]
    pub fn segment_manager(&self) -> &SegmentManager {
        &self.segments
    }

    pub fn segment_manager_mut(&mut self) -> &mut SegmentManager {
        &mut self.segments
    }

    #[must_use]
    pub fn type_manager(&self) -> &TypeManager {
        &self.types
    }

    #[must_use]
    pub fn heap_manager(&self) -> &HeapManager {
        &self.heap_manager
    }

    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    #[must_use]
    pub fn dispatcher(&self) -> &CallDispatcher {
        &self.dispatcher
    }

    #[must_use]
    pub fn current_fiber(&self) -> Option<&Fiber> {
        self.scheduler.current_fiber()
    }

    pub fn current_fiber_mut(&mut self) -> Option<&mut Fiber> {
        self.scheduler.current_fiber_mut()
    }

    #[allow(clippy::type_complexity)]
    fn current(
        &mut self,
    ) -> Result<(&CallDispatcher, &mut SegmentManager, &HeapManager, &mut Fiber)> {
        let fiber = self
            .scheduler
            .current_fiber_mut()
            .ok_or_else(|| RuntimeError::invariant("no current task"))?;
        Ok((&self.dispatcher, &mut self.segments, &self.heap_manager, fiber))
    }

    pub fn call_static(&mut self, address: Address, arguments: Vec<Value>) -> Result<()> {
        let (dispatcher, segments, _, fiber) = self.current()?;
        dispatcher.call_static(segments, fiber, address, arguments)
    }

    pub fn call_virtual(
        &mut self,
        receiver: Value,
        address: Address,
        arguments: Vec<Value>,
    ) -> Result<()> {
        let (dispatcher, segments, heap, fiber) = self.current()?;
        dispatcher.call_virtual(segments, heap, fiber, receiver, address, arguments)
    }

    pub fn call_concept(
        &mut self,
        receiver: Value,
        concept: Value,
        action: Address,
        arguments: Vec<Value>,
    ) -> Result<()> {
        let (dispatcher, segments, heap, fiber) = self.current()?;
        dispatcher.call_concept(segments, heap, fiber, receiver, concept, action, arguments)
    }

    pub fn call_existential(
        &mut self,
        receiver: Value,
        existential: Value,
        address: Address,
        arguments: Vec<Value>,
    ) -> Result<()> {
        let (dispatcher, segments, _, fiber) = self.current()?;
        dispatcher.call_existential(segments, fiber, receiver, existential, address, arguments)
    }

    pub fn init_static(&mut self, address: Address) -> Result<()> {
        let (dispatcher, segments, _, fiber) = self.current()?;
        dispatcher.init_static(segments, fiber, address)
    }

    pub fn return_to_caller(&mut self) -> Result<ReturnOutcome> {
        let (dispatcher, _, _, fiber) = self.current()?;
        dispatcher.return_to_caller(fiber)
    }

    /// Collects everything not reachable from a fiber, a static or a main
    /// argument.
    pub fn collect_garbage(&mut self) -> CollectionStats {
        let mut roots = VmRoots {
            scheduler: &mut self.scheduler,
            segments: &mut self.segments,
            arguments: &mut self.main_arguments,
        };
        self.heap_manager.heap().write().collect(&mut roots)
    }
}
