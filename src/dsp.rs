//! Sample-stream processing ahead of the FIFO.

pub mod overlap;

use num_complex::Complex32;

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorUpdate<T> {
    None,
    Snapshot(T),
}

impl<T> From<ProcessorUpdate<T>> for Option<T> {
    fn from(update: ProcessorUpdate<T>) -> Self {
        match update {
            ProcessorUpdate::Snapshot(s) => Some(s),
            ProcessorUpdate::None => None,
        }
    }
}

pub trait SampleProcessor {
    type Output;

    fn process_block(&mut self, samples: &[Complex32]) -> ProcessorUpdate<Self::Output>;
    fn reset(&mut self);
}

pub trait Reconfigurable<Cfg> {
    fn update_config(&mut self, config: Cfg);
}
