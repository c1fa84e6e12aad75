//! Fan-out/fan-in over tasks.

use crate::error::CoreError;
use crate::task::Task;
use std::cell::RefCell;
use std::rc::Rc;

struct Gather<O> {
    remaining: usize,
    values: Vec<Option<O>>,
    last_error: Option<CoreError>,
}

/// Launches one task per input and completes once all of them finished.
///
/// Individual failures do not short-circuit: the returned task waits for
/// every sub-task and then fails with the last error seen, if any.
pub fn task_for_each<I, F>(inputs: I, f: F) -> Task<()>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Task<()>,
{
    task_collect(inputs, f).map(|_| ())
}

/// Launches one task per input and gathers their values in input order.
///
/// Completes once every sub-task finished. If any failed, the result is
/// the last error seen and the values are discarded.
pub fn task_collect<I, F, O>(inputs: I, f: F) -> Task<Vec<O>>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Task<O>,
    O: 'static,
{
    let result = Task::new();
    let tasks: Vec<Task<O>> = inputs.into_iter().map(f).collect();
    if tasks.is_empty() {
        result.set_result(Vec::new());
        return result;
    }

    let gather = Rc::new(RefCell::new(Gather {
        remaining: tasks.len(),
        values: tasks.iter().map(|_| None).collect(),
        last_error: None,
    }));

    for (index, task) in tasks.into_iter().enumerate() {
        let gather = Rc::clone(&gather);
        let result = result.clone();
        task.then_result(move |outcome| {
            let finished = {
                let mut state = gather.borrow_mut();
                match outcome {
                    Ok(value) => state.values[index] = Some(value),
                    Err(e) => state.last_error = Some(e),
                }
                state.remaining -= 1;
                state.remaining == 0
            };
            if !finished {
                return;
            }

            let (error, values) = {
                let mut state = gather.borrow_mut();
                (state.last_error.take(), std::mem::take(&mut state.values))
            };
            match error {
                Some(e) => result.set_error(e),
                None => result.set_result(values.into_iter().flatten().collect()),
            }
        });
    }

    result
}

/// Like [`task_collect`], flattening one level of per-input sequences.
pub fn task_collect_flat<I, F, O>(inputs: I, f: F) -> Task<Vec<O>>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Task<Vec<O>>,
    O: 'static,
{
    task_collect(inputs, f).map(|nested| nested.into_iter().flatten().collect())
}
