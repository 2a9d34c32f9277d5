use std::{error::Error, fmt::Display, sync::mpsc};

use icogrid::{
    component::ComponentError,
    error::{IcoError, LoadError},
};

#[derive(Debug)]
pub enum CliError {
    Engine(IcoError),
    Load(LoadError),
    Component(ComponentError),
    IOError(std::io::Error),
    MPSCSendError,
    MPSCRecvError(mpsc::RecvError),
    JoinError,
}

impl Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Engine(e) => write!(f, "{}", e),
            CliError::Load(e) => write!(f, "{}", e),
            CliError::Component(e) => write!(f, "{}", e),
            CliError::IOError(e) => write!(f, "io error: {}", e),
            other => write!(f, "{:?}", other),
        }
    }
}

impl Error for CliError {}

impl From<IcoError> for CliError {
    fn from(value: IcoError) -> Self {
        Self::Engine(value)
    }
}

impl From<LoadError> for CliError {
    fn from(value: LoadError) -> Self {
        Self::Load(value)
    }
}

impl From<ComponentError> for CliError {
    fn from(value: ComponentError) -> Self {
        Self::Component(value)
    }
}

impl From<std::io::Error> for CliError {
    fn from(value: std::io::Error) -> Self {
        Self::IOError(value)
    }
}

impl<T> From<mpsc::SendError<T>> for CliError {
    fn from(_: mpsc::SendError<T>) -> Self {
        Self::MPSCSendError
    }
}

impl From<mpsc::RecvError> for CliError {
    fn from(value: mpsc::RecvError) -> Self {
        Self::MPSCRecvError(value)
    }
}
