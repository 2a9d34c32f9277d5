//! Defines the Component trait, used by every stage of a frame pipeline.
//! This gives the stages a common interface, so that each one can consume
//! frames from the stage before it, process them, and pass the results to
//! the stage after it, each on its own thread.

use log::{info, warn};
use std::fmt;
use std::sync::mpsc::{Receiver, Sender};
use std::thread::{self, JoinHandle};

use crate::error::{IcoError, LoadError};

/// Failures a stage can report, either while converting or while shutting
/// down.
#[derive(Debug)]
pub enum ComponentError {
    /// The engine rejected a frame
    Engine(IcoError),
    /// Writing or reading stage output failed
    Load(LoadError),
}

impl fmt::Display for ComponentError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ComponentError::Engine(e) => write!(f, "engine: {}", e),
            ComponentError::Load(e) => write!(f, "load: {}", e),
        }
    }
}

impl std::error::Error for ComponentError {}

impl From<IcoError> for ComponentError {
    fn from(value: IcoError) -> Self {
        Self::Engine(value)
    }
}

impl From<LoadError> for ComponentError {
    fn from(value: LoadError) -> Self {
        Self::Load(value)
    }
}

///
/// A stage in a frame pipeline: a convolution layer, a writer, anything
/// that turns one value into another. All of them implement Component so
/// they can be chained with channels.
///
pub trait Component: ToString {
    /// What the stage consumes
    type InData;
    /// What the stage produces
    type OutData;

    /// Converts an input of type InData into an output of type OutData
    fn convert(&mut self, input: Self::InData) -> Self::OutData;

    /// Cleans up at termination of pipeline
    fn finalize(&mut self) -> Result<(), ComponentError>;
}

/// Runs the given Component on its own thread. On receiving data of type
/// InData on the input channel, the Component converts them to data of type
/// OutData and sends it to the output channel. The thread ends, after
/// finalizing the Component, once the input channel hangs up.
pub fn run_component<C: Component + Send + 'static>(
    mut component: Box<C>,
    input: Receiver<<C as Component>::InData>,
    output: Sender<<C as Component>::OutData>,
) -> JoinHandle<()>
where
    <C as Component>::InData: Send + 'static,
    <C as Component>::OutData: Send + 'static,
{
    thread::spawn(move || {
        while let Ok(data) = input.recv() {
            let out_data = component.convert(data);
            if let Err(error) = output.send(out_data) {
                warn!("{} : received error {}.", component.to_string(), error);
            }
        }

        if let Err(component_error) = component.finalize() {
            warn!(
                "{} : error during terminating : {component_error}.",
                component.to_string(),
            );
        }
        info!("{} : terminated.", component.to_string());
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    /// Adds one to every frame
    struct MockComponent {
        seen: usize,
    }

    impl MockComponent {
        fn new() -> Self {
            Self { seen: 0 }
        }
    }

    impl Component for MockComponent {
        type InData = i32;
        type OutData = i32;

        fn convert(&mut self, input: i32) -> i32 {
            self.seen += 1;
            input + 1
        }

        fn finalize(&mut self) -> Result<(), ComponentError> {
            if self.seen == 0 {
                return Err(IcoError::Configuration("no frames".to_string()).into());
            }
            Ok(())
        }
    }

    impl fmt::Display for MockComponent {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "MockComponent")
        }
    }

    /// Writing a value to the Component's input produces that value,
    /// converted, on the Component's output
    #[test]
    fn test_mock_component() {
        let (test_tx, block_rx) = channel::<i32>();
        let (block_tx, test_rx) = channel::<i32>();

        let handle = run_component(Box::new(MockComponent::new()), block_rx, block_tx);

        assert_eq!(test_tx.send(0), Ok(()));
        assert_eq!(test_rx.recv(), Ok(1));
        drop(test_tx);
        handle.join().unwrap();
    }

    #[test]
    fn test_chained_component() {
        let (test_tx, block_a_rx) = channel::<i32>();
        let (block_a_tx, block_b_rx) = channel::<i32>();
        let (block_b_tx, test_rx) = channel::<i32>();

        run_component(Box::new(MockComponent::new()), block_a_rx, block_a_tx);
        run_component(Box::new(MockComponent::new()), block_b_rx, block_b_tx);

        for i in 0..5 {
            assert_eq!(test_tx.send(i), Ok(()));
        }
        let out: Vec<i32> = (0..5).map(|_| test_rx.recv().unwrap()).collect();
        assert_eq!(out, vec![2, 3, 4, 5, 6]);
    }

    /// A failing finalize is logged, not propagated as a panic
    #[test]
    fn test_finalize_error_does_not_panic() {
        let (test_tx, block_rx) = channel::<i32>();
        let (block_tx, _test_rx) = channel::<i32>();
        let handle = run_component(Box::new(MockComponent::new()), block_rx, block_tx);
        drop(test_tx);
        assert!(handle.join().is_ok());
    }

    #[test]
    fn errors_convert() {
        let e: ComponentError = LoadError::NoDelimiter.into();
        assert!(e.to_string().starts_with("load"));
    }
}
