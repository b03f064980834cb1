/// Identifies who submitted a task, so queued tasks can be withdrawn together.
pub type TaskId = u64;

/// A unit of work for the worker pool. `run` consumes the task, so it runs at most once.
pub trait Task: 'static + Send {
    fn id(&self) -> TaskId;
    fn run(self: Box<Self>, worker: usize);
}

/// A task made from a closure. The closure receives the ordinal of the worker running it.
pub struct ClosureTask<F> {
    id: TaskId,
    f: F,
}

impl<F: FnOnce(usize) + Send + 'static> Task for ClosureTask<F> {
    fn id(&self) -> TaskId {
        self.id
    }

    fn run(self: Box<Self>, worker: usize) {
        (self.f)(worker)
    }
}

pub fn task<F: FnOnce(usize) + Send + 'static>(id: TaskId, f: F) -> Box<dyn Task> {
    Box::new(ClosureTask { id, f })
}
