//! Bounded fan-in: several producers feeding one stream.
//!
//! A dispatcher thread starts the producers in order, keeping at most `max_concurrent` of them
//! running. Each producer runs on its own [`Worker`], which reports back over a
//! `crossbeam-channel` when it is done so the dispatcher can join it and start the next one.
//!
//! The producers share the consumer's [`BoundedChannel`], but report their terminal events
//! through a [`Member`] sink: a member completing does not complete the stream (the dispatcher
//! does that once all of them have), while a member failing fails it right away, after which the
//! dispatcher disposes the rest.

use std::sync::Arc;

use crossbeam_channel::Sender;

use crate::{
    channel::BoundedChannel,
    config::Config,
    drop::defer,
    error::{Error, Result},
    producer::{Producer, ProducerTask, TerminalSink},
    worker::{Worker, WorkerBuilder},
};

struct Member<T> {
    channel: Arc<BoundedChannel<T>>,
}

impl<T: Send> TerminalSink for Member<T> {
    fn on_complete(&self) {}

    fn on_error(&self, error: Error) {
        self.channel.fail(error);
    }
}

/// Creates tasks for `producers` and spawns the dispatcher that runs them.
pub(crate) fn start<T: Send + 'static>(
    producers: Vec<Producer<T>>,
    channel: Arc<BoundedChannel<T>>,
    config: &Config,
) -> Result<(Vec<Arc<ProducerTask<T>>>, Worker)> {
    let sink: Arc<dyn TerminalSink> = Arc::new(Member {
        channel: channel.clone(),
    });
    let base = config.get_name().unwrap_or("merge");
    let tasks: Vec<_> = producers
        .into_iter()
        .enumerate()
        .map(|(i, producer)| {
            let producer = if producer.get_name().is_some() {
                producer
            } else {
                producer.name(format!("{base}-{i}"))
            };
            ProducerTask::new(producer, channel.clone(), sink.clone(), config.get_poll_interval())
        })
        .collect();

    let dispatcher = Dispatcher {
        tasks: tasks.clone(),
        channel,
        max_concurrent: config.get_max_concurrent(),
    };
    match WorkerBuilder::new()
        .name(format!("{base}-dispatch"))
        .spawn(move || dispatcher.run())
    {
        Ok(worker) => Ok((tasks, worker)),
        Err(e) => {
            for task in &tasks {
                task.dispose();
            }
            Err(e.into())
        }
    }
}

struct Dispatcher<T> {
    tasks: Vec<Arc<ProducerTask<T>>>,
    channel: Arc<BoundedChannel<T>>,
    max_concurrent: usize,
}

impl<T: Send + 'static> Dispatcher<T> {
    fn run(self) {
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        let mut workers: Vec<Option<Worker>> = self.tasks.iter().map(|_| None).collect();
        let mut pending = self.tasks.iter().enumerate();
        let mut running = 0;
        let mut stopping = false;

        loop {
            while !stopping && running < self.max_concurrent {
                let Some((index, task)) = pending.next() else {
                    break;
                };
                if task.is_disposed() {
                    continue;
                }
                match self.spawn(index, task, done_tx.clone()) {
                    Ok(worker) => {
                        workers[index] = Some(worker);
                        running += 1;
                    }
                    Err(e) => {
                        log::error!("failed to spawn worker for {}: {e}", task.name());
                        self.channel.fail(e.into());
                        stopping = true;
                    }
                }
            }

            if running == 0 {
                break;
            }
            // We hold a sender ourselves, so this cannot disconnect.
            let Ok(index) = done_rx.recv() else {
                break;
            };
            if let Some(worker) = workers[index].take() {
                worker.join();
            }
            running -= 1;

            if !stopping && (self.channel.is_terminated() || self.channel.is_cancelled()) {
                log::debug!("merged stream stopped, disposing remaining producers");
                stopping = true;
                for task in &self.tasks {
                    task.dispose();
                }
            }
        }

        if stopping {
            for task in &self.tasks {
                task.dispose();
            }
        } else {
            self.channel.complete();
        }
    }

    fn spawn(
        &self,
        index: usize,
        task: &Arc<ProducerTask<T>>,
        done: Sender<usize>,
    ) -> std::io::Result<Worker> {
        let task = task.clone();
        WorkerBuilder::new()
            .name(task.name().to_string())
            .spawn(move || {
                let _notify = defer(move || {
                    done.send(index).ok();
                });
                task.run();
            })
    }
}
