//! Per-node polling task.
//!
//! Each configured node gets one [`NodePoller`] that keeps the node's
//! window of the shared table in sync with the remote device:
//!
//! ```text
//! Disconnected -> Connecting -> Polling --(cycle ok)--> Polling
//!                     ^  |          |
//!                     +--+          +--(transport error)--> Disconnected
//!              (connect failed,
//!               wait one interval)
//! ```
//!
//! A poll cycle runs coils, discrete inputs, input registers, holding
//! registers and finally sets the node's liveness bit. Any transport error
//! clears the liveness bit and drops the connection; the poller then
//! reconnects at the poll interval, forever.

use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::config::NodeConfig;
use crate::device::{Connector, RemoteDevice, TransportError};
use crate::reconcile::{Changes, RegionCache};
use crate::table::{AddressError, AddressSpace, BitRegion, BitWindow, WordRegion, WordWindow};

/// Connection state of a poller.
pub enum PollState<D> {
    Disconnected,
    Connecting,
    Polling(D),
}

/// [`PollState`] without the connection, for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    Polling,
}

impl<D> PollState<D> {
    /// The state without its connection.
    pub fn phase(&self) -> Phase {
        match self {
            PollState::Disconnected => Phase::Disconnected,
            PollState::Connecting => Phase::Connecting,
            PollState::Polling(_) => Phase::Polling,
        }
    }
}

/// The node's validated windows into the shared table.
#[derive(Debug, Clone, Copy)]
struct NodeWindows {
    coils: BitWindow,
    discrete_inputs: BitWindow,
    mirror: Option<BitWindow>,
    liveness: BitWindow,
    holding_registers: WordWindow,
    input_registers: WordWindow,
}

impl NodeWindows {
    fn bind(node: &NodeConfig, space: &AddressSpace) -> Result<Self, AddressError> {
        let layout = node.layout();
        let bits = |region, range: &std::ops::Range<usize>| {
            space.bit_window(region, range.start, range.len())
        };
        let words = |region, range: &std::ops::Range<usize>| {
            space.word_window(region, range.start, range.len())
        };

        Ok(Self {
            coils: bits(BitRegion::Coils, &layout.coils)?,
            discrete_inputs: bits(BitRegion::DiscreteInputs, &layout.discrete_inputs)?,
            mirror: layout
                .mirror
                .as_ref()
                .map(|range| bits(BitRegion::DiscreteInputs, range))
                .transpose()?,
            liveness: space.bit_window(BitRegion::DiscreteInputs, layout.liveness, 1)?,
            holding_registers: words(WordRegion::HoldingRegisters, &layout.holding_registers)?,
            input_registers: words(WordRegion::InputRegisters, &layout.input_registers)?,
        })
    }
}

/// A poller for a single remote node.
pub struct NodePoller<C: Connector> {
    node: NodeConfig,
    connector: C,
    space: Arc<AddressSpace>,
    windows: NodeWindows,
    coils: RegionCache<bool>,
    holding_registers: RegionCache<u16>,
    state: PollState<C::Device>,
    live: bool,
    consecutive_failures: u32,
}

impl<C: Connector> NodePoller<C> {
    /// Create a poller for `node`.
    ///
    /// Fails if the node's windows do not fit the allocated table.
    pub fn new(
        node: NodeConfig,
        connector: C,
        space: Arc<AddressSpace>,
    ) -> Result<Self, AddressError> {
        let windows = NodeWindows::bind(&node, &space)?;

        Ok(Self {
            coils: RegionCache::new(windows.coils.len()),
            holding_registers: RegionCache::new(windows.holding_registers.len()),
            node,
            connector,
            space,
            windows,
            state: PollState::Disconnected,
            live: false,
            consecutive_failures: 0,
        })
    }

    /// Configuration of the polled node.
    pub fn node(&self) -> &NodeConfig {
        &self.node
    }

    /// Current connection state.
    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Whether the last attempted cycle completed.
    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Table address of this node's liveness bit.
    pub fn liveness_address(&self) -> usize {
        self.windows.liveness.start()
    }

    /// Run the polling loop until the task is aborted.
    #[tracing::instrument(name = "node", skip_all, fields(name = %self.node.name))]
    pub async fn run(mut self) {
        info!(
            host = %self.node.host,
            port = self.node.port,
            unit_id = self.node.unit_id,
            offset = self.node.offset,
            interval_secs = self.node.poll_interval_secs,
            "Starting poller"
        );

        loop {
            self.step().await;
        }
    }

    /// Perform one state transition.
    pub async fn step(&mut self) {
        let interval = self.node.poll_interval();

        self.state = match std::mem::replace(&mut self.state, PollState::Disconnected) {
            PollState::Disconnected => {
                trace!("Opening connection");
                PollState::Connecting
            }
            PollState::Connecting => match self.connector.connect().await {
                Ok(device) => {
                    debug!("Connected");
                    PollState::Polling(device)
                }
                Err(e) => {
                    self.on_failure(&e);
                    tokio::time::sleep(interval).await;
                    PollState::Connecting
                }
            },
            PollState::Polling(mut device) => {
                tokio::time::sleep(interval).await;
                trace!("Poll");

                match self.poll_cycle(&mut device).await {
                    Ok(()) => {
                        self.on_success();
                        if self.node.persistent {
                            PollState::Polling(device)
                        } else {
                            trace!("Closing non-persistent connection");
                            PollState::Disconnected
                        }
                    }
                    Err(e) => {
                        self.on_failure(&e);
                        PollState::Disconnected
                    }
                }
            }
        };
    }

    async fn poll_cycle(&mut self, device: &mut C::Device) -> Result<(), TransportError> {
        if self.node.coils.is_enabled() {
            self.sync_coils(device).await?;
        }

        if self.node.discrete_inputs.is_enabled() {
            let window = self.windows.discrete_inputs;
            let values = device
                .read_discrete_inputs(
                    self.node.discrete_inputs.start,
                    self.node.discrete_inputs.count,
                )
                .await?;
            self.space
                .update(|t| t.bits_mut(&window).copy_from_slice(&values));
        }

        if self.node.input_registers.is_enabled() {
            let window = self.windows.input_registers;
            let values = device
                .read_input_registers(
                    self.node.input_registers.start,
                    self.node.input_registers.count,
                )
                .await?;
            self.space
                .update(|t| t.words_mut(&window).copy_from_slice(&values));
        }

        if self.node.holding_registers.is_enabled() {
            self.sync_holding_registers(device).await?;
        }

        Ok(())
    }

    async fn sync_coils(&mut self, device: &mut C::Device) -> Result<(), TransportError> {
        let start = self.node.coils.start;
        let window = self.windows.coils;

        if self.node.coil_push_only {
            let values = self.space.read(|t| t.bits(&window).to_vec());
            return device.write_coils(start, &values).await;
        }

        let remote = device.read_coils(start, self.node.coils.count).await?;

        let cache = &mut self.coils;
        let mirror = self.windows.mirror;
        let reconciled = self.space.update(|t| {
            if let Some(mirror) = &mirror {
                t.bits_mut(mirror).copy_from_slice(&remote);
            }
            cache.reconcile(&remote, t.bits_mut(&window))
        });
        log_changes("coils", &reconciled.changes);

        for run in &reconciled.pushes {
            device.write_coils(start + run.index as u16, &run.values).await?;
            self.coils.commit(run);
        }

        Ok(())
    }

    async fn sync_holding_registers(
        &mut self,
        device: &mut C::Device,
    ) -> Result<(), TransportError> {
        let start = self.node.holding_registers.start;
        let window = self.windows.holding_registers;

        if self.node.hr_push_only {
            let values = self.space.read(|t| t.words(&window).to_vec());
            return device.write_registers(start, &values).await;
        }

        let remote = device
            .read_holding_registers(start, self.node.holding_registers.count)
            .await?;

        let cache = &mut self.holding_registers;
        let reconciled = self
            .space
            .update(|t| cache.reconcile(&remote, t.words_mut(&window)));
        log_changes("holding_registers", &reconciled.changes);

        for run in &reconciled.pushes {
            device
                .write_registers(start + run.index as u16, &run.values)
                .await?;
            self.holding_registers.commit(run);
        }

        Ok(())
    }

    fn set_liveness(&mut self, live: bool) {
        let window = self.windows.liveness;
        self.space.update(|t| t.bits_mut(&window)[0] = live);
        self.live = live;
    }

    fn on_success(&mut self) {
        if self.consecutive_failures > 0 {
            info!(failures = self.consecutive_failures, "Node back online");
        }
        self.consecutive_failures = 0;
        self.set_liveness(true);
    }

    fn on_failure(&mut self, error: &TransportError) {
        self.set_liveness(false);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if self.consecutive_failures == 1 {
            warn!(error = %error, "Node offline, reconnecting");
        } else {
            debug!(
                error = %error,
                failures = self.consecutive_failures,
                "Reconnect attempt failed"
            );
        }
    }
}

fn log_changes<T: std::fmt::Debug>(region: &'static str, changes: &Changes<T>) {
    if changes.is_quiet() {
        return;
    }

    debug!(
        region,
        pushed = changes.pushes(),
        pulled = changes.pulls(),
        "Reconciled"
    );
    trace!(
        region,
        master_changed = ?changes.master_changed,
        slave_changed = ?changes.slave_changed,
        resolutions = ?changes.resolutions,
        "Change detail"
    );
}
