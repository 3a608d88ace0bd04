use std::{
    cmp::Reverse,
    collections::{BTreeMap, BinaryHeap, VecDeque},
    time::Instant,
};

use crate::{Fiber, FiberCreateInfo, Result, RootProvider, RuntimeError, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Main,
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Waiting,
    Done,
}

/// A schedulable execution context.
#[derive(Debug)]
pub struct Task {
    id: TaskId,
    kind: TaskKind,
    state: TaskState,
    fiber: Fiber,
}

impl Task {
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    #[must_use]
    pub fn state(&self) -> TaskState {
        self.state
    }

    #[must_use]
    pub fn fiber(&self) -> &Fiber {
        &self.fiber
    }

    pub fn fiber_mut(&mut self) -> &mut Fiber {
        &mut self.fiber
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Timer {
    deadline: Instant,
    sequence: u64,
    task: TaskId,
}

/// Timers and completion signals that wake waiting tasks.
#[derive(Debug, Default)]
pub struct EventLoop {
    timers: BinaryHeap<Reverse<Timer>>,
    signals: VecDeque<TaskId>,
    sequence: u64,
}

impl EventLoop {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_timer(&mut self, task: TaskId, deadline: Instant) {
        self.sequence += 1;
        self.timers.push(Reverse(Timer { deadline, sequence: self.sequence, task }));
    }

    pub fn signal(&mut self, task: TaskId) {
        self.signals.push_back(task);
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.peek().map(|Reverse(timer)| timer.deadline)
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.timers.is_empty() || !self.signals.is_empty()
    }

    /// Signalled tasks first, then every timer due at `now`, in deadline order.
    fn take_due(&mut self, now: Instant) -> Vec<TaskId> {
        let mut due: Vec<TaskId> = self.signals.drain(..).collect();
        while let Some(Reverse(timer)) = self.timers.peek() {
            if timer.deadline > now {
                break;
            }
            let task = timer.task;
            self.timers.pop();
            due.push(task);
        }
        due
    }
}

/// Cooperative scheduler over the VM's tasks.
///
/// The ready queue holds every ready task plus the running one, which sits
/// at its front. Selection rotates the queue, so ready tasks run round robin.
#[derive(Debug)]
pub struct Scheduler {
    event_loop: EventLoop,
    fiber_info: FiberCreateInfo,
    tasks: BTreeMap<TaskId, Task>,
    next_id: u64,
    main: TaskId,
    current: Option<TaskId>,
    ready: VecDeque<TaskId>,
    waiting: VecDeque<TaskId>,
    done: VecDeque<TaskId>,
}

impl Scheduler {
    #[must_use]
    pub fn new(event_loop: EventLoop, fiber_info: FiberCreateInfo) -> Self {
        let mut scheduler = Self {
            event_loop,
            fiber_info,
            tasks: BTreeMap::new(),
            next_id: 0,
            main: TaskId(0),
            current: None,
            ready: VecDeque::new(),
            waiting: VecDeque::new(),
            done: VecDeque::new(),
        };
        scheduler.main = scheduler.spawn(TaskKind::Main);
        scheduler
    }

    fn spawn(&mut self, kind: TaskKind) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        let fiber = Fiber::new(&self.fiber_info);
        self.tasks.insert(id, Task { id, kind, state: TaskState::Waiting, fiber });
        self.waiting.push_back(id);
        id
    }

    /// New worker tasks start out waiting.
    pub fn create_task(&mut self) -> TaskId {
        self.spawn(TaskKind::Worker)
    }

    #[must_use]
    pub fn main_task(&self) -> TaskId {
        self.main
    }

    #[must_use]
    pub fn current_task(&self) -> Option<TaskId> {
        self.current
    }

    #[must_use]
    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    #[must_use]
    pub fn num_tasks(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn main_fiber(&self) -> Option<&Fiber> {
        self.task(self.main).map(Task::fiber)
    }

    pub fn main_fiber_mut(&mut self) -> Option<&mut Fiber> {
        let main = self.main;
        self.task_mut(main).map(Task::fiber_mut)
    }

    #[must_use]
    pub fn current_fiber(&self) -> Option<&Fiber> {
        self.task(self.current?).map(Task::fiber)
    }

    pub fn current_fiber_mut(&mut self) -> Option<&mut Fiber> {
        let current = self.current?;
        self.task_mut(current).map(Task::fiber_mut)
    }

    #[must_use]
    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    fn set_state(&mut self, id: TaskId, state: TaskState) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.state = state;
        }
    }

    fn state(&self, id: TaskId) -> Option<TaskState> {
        self.tasks.get(&id).map(Task::state)
    }

    fn detach(queue: &mut VecDeque<TaskId>, id: TaskId) {
        queue.retain(|queued| *queued != id);
    }

    /// Moves a waiting task to the back of the ready queue. Returns false if
    /// the task was not waiting.
    pub fn resume_task(&mut self, id: TaskId) -> bool {
        if self.state(id) != Some(TaskState::Waiting) {
            return false;
        }
        Self::detach(&mut self.waiting, id);
        self.set_state(id, TaskState::Ready);
        self.ready.push_back(id);
        true
    }

    pub fn suspend_task(&mut self, id: TaskId) -> bool {
        if !matches!(self.state(id), Some(TaskState::Ready | TaskState::Running)) {
            return false;
        }
        Self::detach(&mut self.ready, id);
        if self.current == Some(id) {
            self.current = None;
        }
        self.set_state(id, TaskState::Waiting);
        self.waiting.push_back(id);
        true
    }

    pub fn terminate_task(&mut self, id: TaskId) -> bool {
        match self.state(id) {
            Some(TaskState::Ready | TaskState::Running) => Self::detach(&mut self.ready, id),
            Some(TaskState::Waiting) => Self::detach(&mut self.waiting, id),
            Some(TaskState::Done) | None => return false,
        }
        if self.current == Some(id) {
            self.current = None;
        }
        self.set_state(id, TaskState::Done);
        self.done.push_back(id);
        true
    }

    /// Removes a finished worker task. The main task is never destroyed.
    pub fn destroy_task(&mut self, id: TaskId) -> Option<Task> {
        if id == self.main || self.state(id) != Some(TaskState::Done) {
            return None;
        }
        Self::detach(&mut self.done, id);
        self.tasks.remove(&id)
    }

    /// Picks the task to run next and marks it running.
    pub fn select_next_ready(&mut self) -> Option<TaskId> {
        let Some(current) = self.current else {
            let next = self.ready.front().copied()?;
            self.set_state(next, TaskState::Running);
            self.current = Some(next);
            return self.current;
        };
        if self.ready.len() <= 1 {
            return Some(current);
        }
        self.set_state(current, TaskState::Ready);
        self.ready.rotate_left(1);
        let next = self.ready.front().copied()?;
        self.set_state(next, TaskState::Running);
        self.current = Some(next);
        self.current
    }

    /// Puts the main task at the front of the ready queue so the next
    /// selection picks it, whatever ran before.
    pub fn rearm_main(&mut self) -> TaskId {
        let main = self.main;
        if let Some(current) = self.current.take() {
            if current != main {
                self.set_state(current, TaskState::Ready);
            }
        }
        Self::detach(&mut self.ready, main);
        Self::detach(&mut self.waiting, main);
        Self::detach(&mut self.done, main);
        self.set_state(main, TaskState::Ready);
        self.ready.push_front(main);
        main
    }

    pub fn register_timer(&mut self, id: TaskId, deadline: Instant) {
        self.event_loop.register_timer(id, deadline);
    }

    pub fn signal(&mut self, id: TaskId) {
        self.event_loop.signal(id);
    }

    /// Resumes every task whose event is due, without blocking. Returns the
    /// number of tasks made ready.
    pub fn poll(&mut self) -> usize {
        let due = self.event_loop.take_due(Instant::now());
        due.into_iter().filter(|id| self.resume_task(*id)).count()
    }

    /// Like [`Self::poll`], but sleeps until the next timer when nothing is
    /// ready yet.
    pub fn blocking_poll(&mut self) -> Result<usize> {
        if !self.ready.is_empty() {
            return Ok(self.poll());
        }
        if self.waiting.is_empty() {
            return Err(RuntimeError::invariant("aborting blocking poll: no tasks are waiting"));
        }
        if !self.event_loop.has_pending() {
            return Err(RuntimeError::invariant("aborting blocking poll: no pending events"));
        }
        if let Some(deadline) = self.event_loop.next_deadline() {
            let now = Instant::now();
            if deadline > now && self.event_loop.signals.is_empty() {
                std::thread::sleep(deadline - now);
            }
        }
        Ok(self.poll())
    }
}

impl RootProvider for Scheduler {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for task in self.tasks.values_mut() {
            task.fiber.visit_roots(visitor);
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        log::debug!(
            "releasing scheduler with {} tasks ({} ready, {} waiting)",
            self.tasks.len(),
            self.ready.len(),
            self.waiting.len()
        );
    }
}
