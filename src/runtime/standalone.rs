//! Standalone Node
//!
//! Runs the same render logic as a cluster node in a single process: no
//! replication, no barrier, and the process always owns its maintenance.

use crate::context::StandaloneContext;
use crate::frame::FrameData;

pub struct StandaloneNode<S, N = (), C = ()> {
    next_frame: u64,
    state: S,
    node_resources: N,
    context_resources: C,
}

impl<S: FrameData, N, C> StandaloneNode<S, N, C> {
    pub fn new(state: S, node_resources: N, context_resources: C) -> Self {
        Self {
            next_frame: 0,
            state,
            node_resources,
            context_resources,
        }
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn node_resources(&self) -> &N {
        &self.node_resources
    }

    pub fn next_frame(&self) -> u64 {
        self.next_frame
    }

    /// Whether the last frame asked to stop
    pub fn is_finished(&self) -> bool {
        self.state.quit_requested()
    }

    /// Mutate the state, then render one frame with it
    pub fn run_frame<R>(
        &mut self,
        mutate: impl FnOnce(&mut S),
        render: impl FnOnce(&StandaloneContext<'_, S, N, C>) -> R,
    ) -> R {
        mutate(&mut self.state);
        let ctx = StandaloneContext::new(
            self.next_frame,
            &self.state,
            &self.node_resources,
            &self.context_resources,
        );
        let output = render(&ctx);
        self.next_frame += 1;
        output
    }
}
