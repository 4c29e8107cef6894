// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A dedicated worker thread with a sequenced task queue.
//!
//! All mutable component and decoder state is confined to the worker; client
//! entry points post closures that run against that state in FIFO order.
//! Teardown enqueues a shutdown sentinel, so tasks posted afterwards are
//! silently dropped instead of dereferencing released state.

use std::sync::mpsc;
use std::thread;
use std::thread::JoinHandle;

use thiserror::Error;

type Task<S> = Box<dyn FnOnce(&mut S) + Send>;

enum Message<S> {
    Task(Task<S>),
    Shutdown,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to spawn worker thread: {0}")]
    Spawn(std::io::Error),
    #[error("worker state initialization failed: {0}")]
    Init(anyhow::Error),
    #[error("worker thread died before initialization completed")]
    Died,
}

/// A clonable handle posting tasks onto the worker owning state `S`.
pub struct TaskRunner<S> {
    tx: mpsc::Sender<Message<S>>,
}

impl<S> Clone for TaskRunner<S> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<S: 'static> TaskRunner<S> {
    /// Posts `task` for execution on the worker. A no-op once the worker has
    /// shut down.
    pub fn post(&self, task: impl FnOnce(&mut S) + Send + 'static) {
        if self.tx.send(Message::Task(Box::new(task))).is_err() {
            log::debug!("Task posted after worker shutdown, dropping");
        }
    }

    /// Posts `task` and blocks until it has run, returning its result.
    /// Returns `None` when the worker is already gone.
    pub fn post_and_wait<R: Send + 'static>(
        &self,
        task: impl FnOnce(&mut S) -> R + Send + 'static,
    ) -> Option<R> {
        let (done_tx, done_rx) = mpsc::channel();
        self.post(move |state| {
            let _ = done_tx.send(task(state));
        });
        done_rx.recv().ok()
    }
}

/// The worker thread itself. `spawn` blocks until the state is constructed,
/// `stop` drains nothing: queued tasks behind the sentinel are discarded with
/// the channel.
pub struct WorkerThread<S> {
    runner: TaskRunner<S>,
    join_handle: Option<JoinHandle<()>>,
}

impl<S: 'static> WorkerThread<S> {
    pub fn spawn<F>(name: &str, init: F) -> Result<Self, WorkerError>
    where
        F: FnOnce(TaskRunner<S>) -> anyhow::Result<S> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Message<S>>();
        let runner = TaskRunner { tx: tx.clone() };
        let init_runner = TaskRunner { tx };
        let (init_tx, init_rx) = mpsc::channel();

        let join_handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let mut state = match init(init_runner) {
                    Ok(state) => {
                        let _ = init_tx.send(Ok(()));
                        state
                    }
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };
                while let Ok(message) = rx.recv() {
                    match message {
                        Message::Task(task) => task(&mut state),
                        Message::Shutdown => break,
                    }
                }
            })
            .map_err(WorkerError::Spawn)?;

        match init_rx.recv() {
            Ok(Ok(())) => Ok(Self { runner, join_handle: Some(join_handle) }),
            Ok(Err(e)) => {
                let _ = join_handle.join();
                Err(WorkerError::Init(e))
            }
            Err(_) => {
                let _ = join_handle.join();
                Err(WorkerError::Died)
            }
        }
    }

    pub fn runner(&self) -> &TaskRunner<S> {
        &self.runner
    }

    /// Stops the worker after all currently queued tasks have run and joins
    /// it. The state is dropped on the worker thread.
    pub fn stop(mut self) {
        let _ = self.runner.tx.send(Message::Shutdown);
        if let Some(join_handle) = self.join_handle.take() {
            let _ = join_handle.join();
        }
    }
}

impl<S> Drop for WorkerThread<S> {
    fn drop(&mut self) {
        let _ = self.runner.tx.send(Message::Shutdown);
        if let Some(join_handle) = self.join_handle.take() {
            let _ = join_handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasks_run_in_post_order() {
        let worker = WorkerThread::spawn("test-worker", |_| Ok(Vec::<u32>::new())).unwrap();
        for i in 0..100 {
            worker.runner().post(move |state| state.push(i));
        }
        let seen = worker.runner().post_and_wait(|state| state.clone()).unwrap();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
        worker.stop();
    }

    #[test]
    fn post_and_wait_returns_value() {
        let worker = WorkerThread::spawn("test-worker", |_| Ok(41u32)).unwrap();
        let value = worker.runner().post_and_wait(|state| {
            *state += 1;
            *state
        });
        assert_eq!(value, Some(42));
        worker.stop();
    }

    #[test]
    fn init_failure_is_reported() {
        let result = WorkerThread::<()>::spawn("test-worker", |_| Err(anyhow::anyhow!("nope")));
        assert!(matches!(result, Err(WorkerError::Init(_))));
    }

    #[test]
    fn post_after_stop_is_dropped() {
        let worker = WorkerThread::spawn("test-worker", |_| Ok(0u32)).unwrap();
        let runner = worker.runner().clone();
        worker.stop();
        // Must neither panic nor block.
        runner.post(|state| *state += 1);
        assert_eq!(runner.post_and_wait(|state| *state), None);
    }

    #[test]
    fn runner_posted_from_init_is_usable() {
        let worker = WorkerThread::spawn("test-worker", |runner: TaskRunner<u32>| {
            runner.post(|state| *state += 1);
            Ok(0u32)
        })
        .unwrap();
        assert_eq!(worker.runner().post_and_wait(|state| *state), Some(1));
        worker.stop();
    }
}
