//! Demo Scene
//!
//! A small interactive scene used by the `demo` and `start` commands: a
//! model viewed through an orbiting camera, steered by pointer, keyboard
//! and head-tracker input, with a node-wide cache swept once per frame.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use serde::{Deserialize, Serialize};

use crate::frame::FrameData;

/// Degrees of yaw added per idle frame
const IDLE_SPIN_DEGREES: f32 = 0.5;
/// Degrees of rotation per pixel of pointer drag
const DRAG_SENSITIVITY: f32 = 0.25;
const MIN_DISTANCE: f32 = 0.5;
const MAX_DISTANCE: f32 = 100.0;
const MAX_PITCH: f32 = 89.0;

/// One-shot session data, published once before frame 0
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitData {
    pub model: String,
    pub window_title: String,
    pub contexts: u32,
}

impl InitData {
    pub fn new(model: impl Into<String>, contexts: u32) -> Self {
        let model = model.into();
        Self {
            window_title: format!("lockstep - {}", model),
            model,
            contexts,
        }
    }
}

/// Orbit camera around the model
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraPose {
    /// Degrees, wrapped to [0, 360)
    pub yaw: f32,
    /// Degrees, clamped to ±89
    pub pitch: f32,
    pub distance: f32,
}

impl Default for CameraPose {
    fn default() -> Self {
        Self {
            yaw: 0.0,
            pitch: 15.0,
            distance: 5.0,
        }
    }
}

/// Latest head-tracker sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeadPose {
    pub position: [f32; 3],
    /// Quaternion (x, y, z, w)
    pub orientation: [f32; 4],
}

impl Default for HeadPose {
    fn default() -> Self {
        Self {
            position: [0.0, 1.7, 0.0],
            orientation: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RenderSettings {
    pub wireframe: bool,
    pub show_statistics: bool,
    pub idle_spin: bool,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            wireframe: false,
            show_statistics: false,
            idle_spin: true,
        }
    }
}

/// Interactive state replicated every frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameState {
    pub camera: CameraPose,
    pub head: HeadPose,
    pub settings: RenderSettings,
    /// Whether any input arrived since the last frame
    pub interacted: bool,
    pub quit_requested: bool,
}

/// Input injected into the authoritative state between frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InputEvent {
    PointerDrag { dx: f32, dy: f32 },
    Wheel { delta: f32 },
    KeyPress(char),
    TrackerUpdate { position: [f32; 3], orientation: [f32; 4] },
}

impl FrameState {
    /// Apply one input event
    pub fn apply_input(&mut self, event: &InputEvent) {
        self.interacted = true;
        match event {
            InputEvent::PointerDrag { dx, dy } => {
                self.camera.yaw = (self.camera.yaw + dx * DRAG_SENSITIVITY).rem_euclid(360.0);
                self.camera.pitch =
                    (self.camera.pitch + dy * DRAG_SENSITIVITY).clamp(-MAX_PITCH, MAX_PITCH);
            }
            InputEvent::Wheel { delta } => {
                self.camera.distance =
                    (self.camera.distance * (1.0 - delta * 0.1)).clamp(MIN_DISTANCE, MAX_DISTANCE);
            }
            InputEvent::KeyPress(key) => match key.to_ascii_lowercase() {
                'w' => self.settings.wireframe = !self.settings.wireframe,
                's' => self.settings.show_statistics = !self.settings.show_statistics,
                ' ' => self.settings.idle_spin = !self.settings.idle_spin,
                'r' => self.camera = CameraPose::default(),
                'q' | '\u{1b}' => self.quit_requested = true,
                _ => {}
            },
            InputEvent::TrackerUpdate { position, orientation } => {
                self.head = HeadPose {
                    position: *position,
                    orientation: *orientation,
                };
            }
        }
    }

    /// Advance one frame: spin the camera when nobody is interacting
    pub fn advance(&mut self) {
        if self.settings.idle_spin && !self.interacted {
            self.camera.yaw = (self.camera.yaw + IDLE_SPIN_DEGREES).rem_euclid(360.0);
        }
        self.interacted = false;
    }
}

impl FrameData for FrameState {
    fn quit_requested(&self) -> bool {
        self.quit_requested
    }
}

/// Node-wide texture cache whose sweep is the per-frame maintenance task
#[derive(Debug, Default)]
pub struct CacheSweeper {
    sweeps: AtomicU64,
    last_swept: AtomicU64,
    /// Texture name -> frame it was last used in
    entries: Mutex<HashMap<String, u64>>,
    /// Entries unused for longer than this many frames are evicted
    max_age: u64,
}

impl CacheSweeper {
    pub fn new(max_age: u64) -> Self {
        Self {
            max_age,
            ..Default::default()
        }
    }

    /// Record use of a cache entry during `frame`
    pub fn touch(&self, name: &str, frame: u64) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), frame);
    }

    /// Evict stale entries; returns how many were removed
    pub fn sweep(&self, frame: u64) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        let max_age = self.max_age;
        entries.retain(|_, used| frame.saturating_sub(*used) <= max_age);

        self.sweeps.fetch_add(1, Ordering::AcqRel);
        self.last_swept.store(frame, Ordering::Release);
        before - entries.len()
    }

    /// Sweeps run so far
    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Acquire)
    }

    pub fn last_swept(&self) -> u64 {
        self.last_swept.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
