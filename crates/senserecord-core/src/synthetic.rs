//! Synthetic board driver
//!
//! A software stand-in for `SYNTHETIC_BOARD`: a worker thread generates one
//! sine wave per channel plus uniform noise at the catalogued sampling rate and
//! writes it into the [`SampleSink`].

use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::board::{Board, BoardDescriptor, BoardDriver, SampleBlock, SampleSink};
use crate::catalog::BoardInfo;
use crate::error::{RecordError, Result};

/// Default interval between generated blocks
const DEFAULT_TICK: Duration = Duration::from_millis(20);

/// Driver producing [`SyntheticBoard`] handles
#[derive(Debug, Clone)]
pub struct SyntheticDriver {
    tick: Duration,
}

impl SyntheticDriver {
    pub fn new(tick: Duration) -> Self {
        Self { tick }
    }
}

impl Default for SyntheticDriver {
    fn default() -> Self {
        Self::new(DEFAULT_TICK)
    }
}

impl BoardDriver for SyntheticDriver {
    fn open(&self, _descriptor: &BoardDescriptor, info: BoardInfo) -> Result<Box<dyn Board>> {
        Ok(Box::new(SyntheticBoard::new(info, self.tick)))
    }
}

struct StreamWorker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<(SampleSink, Result<()>)>,
}

/// Simulated board streaming generated samples
pub struct SyntheticBoard {
    info: BoardInfo,
    tick: Duration,
    prepared: bool,
    worker: Option<StreamWorker>,
}

impl SyntheticBoard {
    pub fn new(info: BoardInfo, tick: Duration) -> Self {
        Self {
            info,
            tick,
            prepared: false,
            worker: None,
        }
    }
}

impl Board for SyntheticBoard {
    fn info(&self) -> &BoardInfo {
        &self.info
    }

    fn prepare(&mut self) -> Result<()> {
        self.prepared = true;
        Ok(())
    }

    fn start_stream(&mut self, sink: SampleSink) -> Result<()> {
        if !self.prepared {
            return Err(RecordError::connection(
                self.info.kind.name(),
                "session is not prepared",
            ));
        }
        if self.worker.is_some() {
            return Err(RecordError::connection(
                self.info.kind.name(),
                "stream is already running",
            ));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let rate = f64::from(self.info.sampling_rate);
        let channels = self.info.channel_count();
        let tick = self.tick;

        let handle = thread::Builder::new()
            .name(format!("{}-stream", self.info.kind.name().to_lowercase()))
            .spawn(move || stream_samples(sink, flag, rate, channels, tick))
            .map_err(|e| RecordError::connection(self.info.kind.name(), e))?;

        self.worker = Some(StreamWorker { stop, handle });
        Ok(())
    }

    fn stop_stream(&mut self) -> Result<SampleSink> {
        let worker = self.worker.take().ok_or_else(|| {
            RecordError::connection(self.info.kind.name(), "no stream is running")
        })?;

        worker.stop.store(true, Ordering::Release);
        let (sink, outcome) = worker
            .handle
            .join()
            .map_err(|_| RecordError::IoError("synthetic stream worker panicked".to_string()))?;
        outcome?;
        Ok(sink)
    }

    fn release(&mut self) -> Result<()> {
        if let Some(worker) = self.worker.take() {
            worker.stop.store(true, Ordering::Release);
            let _ = worker.handle.join();
        }
        self.prepared = false;
        Ok(())
    }
}

fn stream_samples(
    mut sink: SampleSink,
    stop: Arc<AtomicBool>,
    rate: f64,
    channels: usize,
    tick: Duration,
) -> (SampleSink, Result<()>) {
    let started = Instant::now();
    let epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    let mut rng = rand::thread_rng();
    let mut emitted: u64 = 0;

    loop {
        // Read the flag before generating so the final block covers up to the stop request
        let stopping = stop.load(Ordering::Acquire);
        let due = (started.elapsed().as_secs_f64() * rate) as u64;

        if due > emitted {
            let mut block = SampleBlock::default();
            for index in emitted..due {
                let t = index as f64 / rate;
                block.timestamps.push(epoch + t);
                block.rows.push(
                    (0..channels)
                        .map(|c| {
                            let freq = (c + 1) as f64;
                            10.0 * (std::f64::consts::TAU * freq * t).sin()
                                + rng.gen_range(-1.0..1.0)
                        })
                        .collect(),
                );
            }
            if let Err(e) = sink.write_block(&block) {
                return (sink, Err(e));
            }
            emitted = due;
        }

        if stopping {
            break;
        }
        thread::sleep(tick);
    }

    (sink, Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::ConflictPolicy;
    use crate::catalog::BoardKind;
    use tempfile::TempDir;

    fn board() -> SyntheticBoard {
        SyntheticBoard::new(BoardKind::SyntheticBoard.info(), Duration::from_millis(5))
    }

    #[test]
    fn test_stream_requires_prepare() {
        let dir = TempDir::new().unwrap();
        let mut board = board();
        let sink = SampleSink::create(
            &dir.path().join("x.csv"),
            &board.info().eeg_channels,
            ConflictPolicy::Abort,
        )
        .unwrap();
        assert_eq!(board.start_stream(sink).unwrap_err().kind(), "connection_error");
    }

    #[test]
    fn test_stream_writes_samples() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.csv");
        let mut board = board();
        board.prepare().unwrap();

        let sink =
            SampleSink::create(&path, &board.info().eeg_channels, ConflictPolicy::Abort).unwrap();
        board.start_stream(sink).unwrap();
        thread::sleep(Duration::from_millis(60));
        let summary = board.stop_stream().unwrap().finish().unwrap();

        assert!(summary.samples_written > 0);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count() as u64, summary.samples_written + 1);
        // 2 bookkeeping columns + 16 channels
        assert_eq!(contents.lines().nth(1).unwrap().split(',').count(), 18);
    }

    #[test]
    fn test_stop_without_stream() {
        let mut board = board();
        board.prepare().unwrap();
        assert!(board.stop_stream().is_err());
        board.release().unwrap();
    }
}
