//! LayerForge — layer-based canvas editing and synchronization engine for
//! generative image pipelines.
//!
//! The interactive half (layer store, gestures, history, compositor) is
//! single-threaded and lives in [`canvas`], [`tools`], [`history`], and
//! [`compositor`]. The cross-process half (wire protocol, transfer staging,
//! execution backend, matting) lives in [`protocol`], [`sync`], [`backend`],
//! and [`matting`], guarded by the single-flight [`gate`].

pub mod backend;
pub mod canvas;
pub mod compositor;
pub mod encode;
pub mod gate;
pub mod history;
pub mod logger;
pub mod matting;
pub mod project;
pub mod protocol;
pub mod sync;
pub mod tools;
