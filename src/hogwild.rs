use std::error::Error;
use std::io;
use std::io::BufRead;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;

/// Work done on one batch of raw input lines. Implementations are shared by
/// all workers, so everything goes through `&self`.
pub trait BatchTask: Send + Sync {
    fn run_task(&self, lines: &[String]) -> io::Result<()>;
}

pub struct HogwildTrainer {
    workers: Vec<JoinHandle<io::Result<()>>>,
    sender: Sender<Vec<String>>,
}

pub struct HogwildWorker {
    task: Arc<dyn BatchTask>,
}

impl HogwildTrainer {
    pub fn new(task: Arc<dyn BatchTask>, num_workers: usize) -> Result<HogwildTrainer, Box<dyn Error>> {
        if num_workers == 0 {
            return Err("hogwild needs at least one worker")?;
        }
        let (sender, receiver): (Sender<Vec<String>>, Receiver<Vec<String>>) = mpsc::channel();
        let mut trainer = HogwildTrainer {
            workers: Vec::with_capacity(num_workers),
            sender,
        };
        let receiver: Arc<Mutex<Receiver<Vec<String>>>> = Arc::new(Mutex::new(receiver));
        for _ in 0..num_workers {
            let worker = HogwildWorker::new(Arc::clone(&task), Arc::clone(&receiver))?;
            trainer.workers.push(worker);
        }
        Ok(trainer)
    }

    pub fn digest_batch(&self, batch: Vec<String>) -> Result<(), Box<dyn Error>> {
        if self.sender.send(batch).is_err() {
            return Err("all hogwild workers have stopped")?;
        }
        Ok(())
    }

    /// Closes the channel and waits until every queued batch is processed
    pub fn block_until_workers_finished(self) -> Result<(), Box<dyn Error>> {
        drop(self.sender);
        let mut first_error: Option<Box<dyn Error>> = None;
        for worker in self.workers {
            let result: Result<(), Box<dyn Error>> = match worker.join() {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err("hogwild worker panicked".into()),
            };
            if let Err(e) = result {
                log::error!("Worker failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl HogwildWorker {
    pub fn new(
        task: Arc<dyn BatchTask>,
        receiver: Arc<Mutex<Receiver<Vec<String>>>>,
    ) -> Result<JoinHandle<io::Result<()>>, Box<dyn Error>> {
        let worker = HogwildWorker { task };
        let thread = thread::Builder::new()
            .name("hogwild-worker".to_string())
            .spawn(move || worker.run(receiver))?;
        Ok(thread)
    }

    pub fn run(&self, receiver: Arc<Mutex<Receiver<Vec<String>>>>) -> io::Result<()> {
        loop {
            // the receiver lock is released before the batch is processed
            let batch = {
                let receiver = receiver.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                receiver.recv()
            };
            match batch {
                Ok(lines) => self.task.run_task(&lines)?,
                Err(_) => return Ok(()),
            }
        }
    }
}

/// Feeds `input` to `threads` workers in batches of `batch_size` lines and
/// returns once all of them are done. Returns the number of lines read.
pub fn dispatch_lines(
    input: &mut dyn BufRead,
    task: Arc<dyn BatchTask>,
    threads: usize,
    batch_size: usize,
) -> Result<u64, Box<dyn Error>> {
    let batch_size = batch_size.max(1);
    let hogwild = HogwildTrainer::new(task, threads)?;
    let mut batch: Vec<String> = Vec::with_capacity(batch_size);
    let mut num_lines: u64 = 0;
    let mut dispatch_error: Option<Box<dyn Error>> = None;

    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                dispatch_error = Some(Box::new(e));
                break;
            }
        };
        num_lines += 1;
        batch.push(line);
        if batch.len() == batch_size {
            let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
            if let Err(e) = hogwild.digest_batch(full) {
                dispatch_error = Some(e);
                break;
            }
        }
        if num_lines % 1_000_000 == 0 {
            log::info!("Dispatched {} lines", num_lines);
        }
    }
    if dispatch_error.is_none() && !batch.is_empty() {
        if let Err(e) = hogwild.digest_batch(batch) {
            dispatch_error = Some(e);
        }
    }

    // workers are always joined, even when reading the input failed
    let joined = hogwild.block_until_workers_finished();
    if let Some(e) = dispatch_error {
        return Err(e);
    }
    joined?;
    Ok(num_lines)
}
