use glam::Vec3;

use crate::splat_buffer::PrecomputedSplats;

pub const DEFAULT_VIEW_EPSILON: f32 = 0.01;
pub const DEFAULT_POSITION_EPSILON: f32 = 0.01;

/// Floats per splat in [`SortedSplats::centers_covariances`].
pub const CENTER_COVARIANCE_STRIDE: usize = 9;
pub const COLOR_STRIDE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DepthMode {
    /// Euclidean distance from the camera.
    #[default]
    Distance,
    /// Distance along the camera forward axis.
    Projected,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SortView {
    pub camera_position: [f32; 3],
    /// Unit forward vector.
    pub forward: [f32; 3],
}

impl SortView {
    pub fn new(camera_position: [f32; 3], forward: [f32; 3]) -> Self {
        Self {
            camera_position,
            forward: Vec3::from_array(forward).normalize_or_zero().to_array(),
        }
    }

    pub fn looking_at(camera_position: [f32; 3], target: [f32; 3]) -> Self {
        let forward = Vec3::from_array(target) - Vec3::from_array(camera_position);
        Self::new(camera_position, forward.to_array())
    }

    /// True when sorting for `other` would give the same order as for `self`.
    pub fn is_close_to(&self, other: &SortView, config: &SortConfig) -> bool {
        let dot = Vec3::from_array(self.forward).dot(Vec3::from_array(other.forward));
        let moved = Vec3::from_array(self.camera_position)
            .distance(Vec3::from_array(other.camera_position));
        dot >= 1.0 - config.view_epsilon && moved <= config.position_epsilon
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SortConfig {
    pub depth_mode: DepthMode,
    pub view_epsilon: f32,
    pub position_epsilon: f32,
    /// When false a pass only produces `order`.
    pub emit_attributes: bool,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            depth_mode: DepthMode::Distance,
            view_epsilon: DEFAULT_VIEW_EPSILON,
            position_epsilon: DEFAULT_POSITION_EPSILON,
            emit_attributes: true,
        }
    }
}

/// Result of one pass: slot indices farthest first, plus attributes in that order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SortedSplats {
    pub order: Vec<u32>,
    /// `cx cy cz xx xy xz yy yz zz` per splat.
    pub centers_covariances: Vec<f32>,
    /// Normalized RGBA per splat.
    pub colors: Vec<f32>,
}

impl SortedSplats {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Maps a float to a `u32` whose unsigned order matches the float order.
#[inline]
pub fn monotonic_key(depth: f32) -> u32 {
    let bits = depth.to_bits();
    if bits & 0x8000_0000 != 0 {
        !bits
    } else {
        bits | 0x8000_0000
    }
}

/// Depth in the high half, inverted so that ascending order is farthest first.
#[inline]
pub fn composite_key(depth: f32, index: u32) -> u64 {
    ((!monotonic_key(depth) as u64) << 32) | index as u64
}

#[inline]
fn depth_of(center: Vec3, view_origin: Vec3, forward: Vec3, mode: DepthMode) -> f32 {
    match mode {
        DepthMode::Distance => center.distance(view_origin),
        DepthMode::Projected => (center - view_origin).dot(forward),
    }
}

pub fn sort_pass(splats: &PrecomputedSplats, view: &SortView, config: &SortConfig) -> SortedSplats {
    let _span = tracing::trace_span!("sort_pass", splats = splats.len()).entered();

    let origin = Vec3::from_array(view.camera_position);
    let forward = Vec3::from_array(view.forward);
    let mut keys: Vec<u64> = splats
        .centers
        .iter()
        .zip(splats.valid.iter())
        .enumerate()
        .filter(|&(_, (_, &valid))| valid)
        .map(|(i, (c, _))| {
            let depth = depth_of(Vec3::from_array(*c), origin, forward, config.depth_mode);
            composite_key(depth, i as u32)
        })
        .collect();
    keys.sort_unstable();

    let order: Vec<u32> = keys.iter().map(|&k| k as u32).collect();
    if !config.emit_attributes {
        return SortedSplats {
            order,
            ..Default::default()
        };
    }

    let mut centers_covariances = Vec::with_capacity(order.len() * CENTER_COVARIANCE_STRIDE);
    let mut colors = Vec::with_capacity(order.len() * COLOR_STRIDE);
    for &i in &order {
        let i = i as usize;
        centers_covariances.extend_from_slice(&splats.centers[i]);
        centers_covariances.extend_from_slice(&splats.covariances[i]);
        colors.extend_from_slice(&splats.colors[i]);
    }
    SortedSplats {
        order,
        centers_covariances,
        colors,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    /// A newer view arrived while a pass was running.
    RunningStale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A pass should start now for this view.
    Started,
    /// Recorded; runs after the in-flight pass, replacing any earlier pending view.
    Coalesced,
    /// Indistinguishable from the view already sorted or scheduled.
    Skipped,
}

/// Coalescing state machine: at most one pass in flight and one pending view.
#[derive(Debug, Clone)]
pub struct SortScheduler {
    config: SortConfig,
    state: SchedulerState,
    running: Option<SortView>,
    pending: Option<SortView>,
    last_sorted: Option<SortView>,
}

impl SortScheduler {
    pub fn new(config: SortConfig) -> Self {
        Self {
            config,
            state: SchedulerState::Idle,
            running: None,
            pending: None,
            last_sorted: None,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn config(&self) -> &SortConfig {
        &self.config
    }

    /// View the in-flight pass is sorting for.
    pub fn running_view(&self) -> Option<SortView> {
        self.running
    }

    fn latest_target(&self) -> Option<SortView> {
        self.pending.or(self.running).or(self.last_sorted)
    }

    pub fn request(&mut self, view: SortView) -> RequestOutcome {
        if let Some(target) = self.latest_target() {
            if view.is_close_to(&target, &self.config) {
                return RequestOutcome::Skipped;
            }
        }
        match self.state {
            SchedulerState::Idle => {
                self.running = Some(view);
                self.state = SchedulerState::Running;
                RequestOutcome::Started
            }
            SchedulerState::Running | SchedulerState::RunningStale => {
                self.pending = Some(view);
                self.state = SchedulerState::RunningStale;
                RequestOutcome::Coalesced
            }
        }
    }

    /// Marks the in-flight pass finished. Returns the view to sort next, if any.
    pub fn complete(&mut self) -> Option<SortView> {
        if let Some(done) = self.running.take() {
            self.last_sorted = Some(done);
        }
        self.advance()
    }

    /// Like [`complete`](Self::complete) for a pass that produced nothing, so
    /// its view is not remembered as sorted.
    pub fn abort(&mut self) -> Option<SortView> {
        self.running = None;
        self.advance()
    }

    fn advance(&mut self) -> Option<SortView> {
        match self.state {
            SchedulerState::RunningStale => {
                self.running = self.pending.take();
                self.state = if self.running.is_some() {
                    SchedulerState::Running
                } else {
                    SchedulerState::Idle
                };
                self.running
            }
            SchedulerState::Running | SchedulerState::Idle => {
                self.state = SchedulerState::Idle;
                None
            }
        }
    }

    /// Abandons in-flight and pending work. The next request always starts a pass.
    pub fn reset(&mut self) {
        self.state = SchedulerState::Idle;
        self.running = None;
        self.pending = None;
        self.last_sorted = None;
    }
}
