// SPDX-License-Identifier: CEPL-1.0
//! Error taxonomy for the rendering core.
//!
//! Leaf components return these values and never terminate the process. The
//! orchestrator decides what is fatal, usually by consulting
//! [`Error::is_fatal`]. A stale swapchain is not an error here: acquire and
//! present report it as an outcome and the renderer heals it in place.

use std::path::PathBuf;

use ash::vk;
use thiserror::Error;

use crate::command::RecorderState;
use crate::image::ImageLayout;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no suitable physical device among {candidates} candidate(s)")]
    NoSuitableDevice { candidates: usize },

    #[error("logical device creation failed during {stage}: {result}")]
    DeviceCreation {
        stage: &'static str,
        result: vk::Result,
    },

    #[error("swapchain creation failed during {stage}: {result}")]
    SwapchainCreation {
        stage: &'static str,
        result: vk::Result,
    },

    #[error(
        "write of {len} bytes at offset {offset} overflows buffer of {capacity} bytes"
    )]
    BufferOverflow {
        offset: vk::DeviceSize,
        len: vk::DeviceSize,
        capacity: vk::DeviceSize,
    },

    #[error("unsupported image layout transition {from:?} -> {to:?}")]
    UnsupportedTransition { from: ImageLayout, to: ImageLayout },

    #[error("image is in layout {actual:?}, operation requires {expected:?}")]
    UnexpectedLayout {
        expected: ImageLayout,
        actual: ImageLayout,
    },

    #[error("cannot {operation} while command recorder is {actual:?}")]
    RecordingState {
        operation: &'static str,
        actual: RecorderState,
    },

    #[error(
        "submit given {semaphores} wait semaphore(s) but {stages} wait stage mask(s)"
    )]
    SubmitArity { semaphores: usize, stages: usize },

    #[error("fence is still pending on a previous submission")]
    FenceInFlight,

    #[error("one-shot transfer failed: {0}")]
    Transfer(#[source] Box<Error>),

    #[error("buffer memory is not host-visible")]
    NotHostVisible,

    #[error("invalid resource size: {0}")]
    InvalidSize(&'static str),

    #[error("resource handle no longer refers to a live allocation")]
    StaleHandle,

    #[error("swapchain image acquisition failed: {0}")]
    Acquire(vk::Result),

    #[error("presentation failed: {0}")]
    Present(vk::Result),

    #[error("{call} failed: {result}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },

    #[error("invalid renderer configuration: {0}")]
    Config(String),

    #[error("failed to read shader {path}: {source}")]
    Shader {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read asset {path}: {source}")]
    Asset {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load the Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("window handle unavailable: {0}")]
    Surface(#[from] raw_window_handle::HandleError),
}

impl Error {
    /// Shorthand for mapping a raw driver result.
    pub fn vulkan(call: &'static str) -> impl FnOnce(vk::Result) -> Error {
        move |result| Error::Vulkan { call, result }
    }

    /// Whether the failure leaves the core without a safe way forward.
    ///
    /// Contract violations (overflow, recorder state, layout misuse) are
    /// programmer errors reported to the immediate caller and are not fatal
    /// by themselves.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::NoSuitableDevice { .. }
            | Error::DeviceCreation { .. }
            | Error::SwapchainCreation { .. }
            | Error::Transfer(_)
            | Error::Acquire(_)
            | Error::Present(_)
            | Error::Loading(_)
            | Error::Surface(_) => true,
            Error::Vulkan { result, .. } => matches!(
                *result,
                vk::Result::ERROR_DEVICE_LOST
                    | vk::Result::ERROR_OUT_OF_HOST_MEMORY
                    | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
                    | vk::Result::ERROR_SURFACE_LOST_KHR
            ),
            Error::BufferOverflow { .. }
            | Error::UnsupportedTransition { .. }
            | Error::UnexpectedLayout { .. }
            | Error::RecordingState { .. }
            | Error::SubmitArity { .. }
            | Error::FenceInFlight
            | Error::NotHostVisible
            | Error::InvalidSize(_)
            | Error::StaleHandle
            | Error::Config(_)
            | Error::Shader { .. }
            | Error::Asset { .. } => false,
        }
    }
}
