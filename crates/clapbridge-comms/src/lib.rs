//! Lockless primitives shared between the host callback and device threads.
//!
//! This crate provides the frame ring buffer the pumps build on, and the
//! auto-reset wake event a device uses to rouse a background pump thread.

pub mod event;
pub mod ring;

pub use event::WakeEvent;
pub use ring::{FrameReader, FrameRingBuffer, FrameSink, FrameSource, FrameWriter};
