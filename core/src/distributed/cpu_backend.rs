use super::backend::{CollectiveBackend, CollectiveError, ReduceOp, Result};
use crate::tensor::{Tensor, TensorElem, TensorError};
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// A message travelling one hop around the ring.
#[derive(Clone, Debug)]
enum Frame {
    Values(Vec<f64>),
    Tensor { shape: Vec<usize>, values: Vec<f64> },
    Bytes(Vec<u8>),
}

impl Frame {
    fn kind(&self) -> &'static str {
        match self {
            Frame::Values(_) => "values",
            Frame::Tensor { .. } => "tensor",
            Frame::Bytes(_) => "bytes",
        }
    }
}

struct RingLinks {
    left_rx: Receiver<Frame>,
    right_tx: Sender<Frame>,
}

/// A CPU-based collective backend where every rank is a thread.
///
/// Implements the **Ring All-Reduce** algorithm using `crossbeam` channels. Rank `r` receives
/// from rank `r - 1` and sends to rank `r + 1` (mod world size). This simulates the data
/// movement that happens on GPUs via NCCL.
///
/// Cloning a `CpuBackend` yields another handle to the *same* rank.
#[derive(Clone)]
pub struct CpuBackend {
    rank: usize,
    world_size: usize,
    local_size: usize,
    links: Arc<RingLinks>,
    initialized: Arc<AtomicBool>,
}

impl CpuBackend {
    fn from_links(rank: usize, world_size: usize, local_size: usize, links: RingLinks) -> Self {
        Self {
            rank,
            world_size,
            local_size,
            links: Arc::new(links),
            initialized: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Builds a ring of `world_size` ranks on a single host.
    pub fn ring(world_size: usize) -> Vec<CpuBackend> {
        Self::ring_with_local_size(world_size, world_size)
    }

    /// Builds a ring of `world_size` ranks, `local_size` per host.
    ///
    /// Rank `r` lives on host `r / local_size` with local rank `r % local_size`.
    pub fn ring_with_local_size(world_size: usize, local_size: usize) -> Vec<CpuBackend> {
        let local_size = local_size.clamp(1, world_size.max(1));

        // Channel i connects rank i to rank i + 1.
        let (txs, rxs): (Vec<_>, Vec<_>) = (0..world_size).map(|_| unbounded::<Frame>()).unzip();
        let mut rxs: Vec<Option<Receiver<Frame>>> = rxs.into_iter().map(Some).collect();

        txs.into_iter()
            .enumerate()
            .map(|(rank, right_tx)| {
                let left = (rank + world_size - 1) % world_size;
                let left_rx = rxs[left].take().unwrap_or_else(|| unreachable!());
                Self::from_links(
                    rank,
                    world_size,
                    local_size,
                    RingLinks { left_rx, right_tx },
                )
            })
            .collect()
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(CollectiveError::NotInitialized)
        }
    }

    fn check_root(&self, root: usize) -> Result<()> {
        if root >= self.world_size {
            return Err(CollectiveError::RankOutOfRange {
                rank: root,
                world_size: self.world_size,
            });
        }
        Ok(())
    }

    fn send(&self, frame: Frame, op: &'static str) -> Result<()> {
        self.links
            .right_tx
            .send(frame)
            .map_err(|_| CollectiveError::Disconnected {
                rank: self.rank,
                op,
            })
    }

    fn recv(&self, op: &'static str) -> Result<Frame> {
        self.links
            .left_rx
            .recv()
            .map_err(|_| CollectiveError::Disconnected {
                rank: self.rank,
                op,
            })
    }

    fn protocol(&self, op: &'static str, expected: &str, got: &Frame) -> CollectiveError {
        CollectiveError::Protocol {
            rank: self.rank,
            op,
            detail: format!("expected {expected} frame, got {}", got.kind()),
        }
    }

    fn recv_values(&self, op: &'static str) -> Result<Vec<f64>> {
        match self.recv(op)? {
            Frame::Values(values) => Ok(values),
            other => Err(self.protocol(op, "values", &other)),
        }
    }

    fn recv_tensor(&self, op: &'static str) -> Result<(Vec<usize>, Vec<f64>)> {
        match self.recv(op)? {
            Frame::Tensor { shape, values } => Ok((shape, values)),
            other => Err(self.protocol(op, "tensor", &other)),
        }
    }

    fn recv_bytes(&self, op: &'static str) -> Result<Vec<u8>> {
        match self.recv(op)? {
            Frame::Bytes(bytes) => Ok(bytes),
            other => Err(self.protocol(op, "bytes", &other)),
        }
    }

    /// Index of the chunk handled at `step`, offset by `shift`, for this rank.
    fn chunk_index(&self, step: usize, shift: usize) -> usize {
        // (rank - step - shift) mod world_size, kept in unsigned arithmetic.
        let w = self.world_size;
        (self.rank + 2 * w - step - shift) % w
    }

    /// Two-phase ring all-reduce over widened values.
    fn ring_allreduce(&self, mut data: Vec<f64>, op: ReduceOp) -> Result<Vec<f64>> {
        let total_elements = data.len();
        let chunk_size = total_elements.div_ceil(self.world_size);
        let chunk = |idx: usize| -> Range<usize> {
            let start = (idx * chunk_size).min(total_elements);
            let end = (start + chunk_size).min(total_elements);
            start..end
        };

        // --- Phase 1: Scatter-Reduce ---
        // Each step sends one chunk right and folds the chunk received from the left into ours.
        for step in 0..self.world_size - 1 {
            let send_range = chunk(self.chunk_index(step, 0));
            self.send(Frame::Values(data[send_range].to_vec()), "allreduce")?;

            let received = self.recv_values("allreduce")?;
            let recv_range = chunk(self.chunk_index(step, 1));
            if received.len() != recv_range.len() {
                return Err(CollectiveError::Protocol {
                    rank: self.rank,
                    op: "allreduce",
                    detail: format!(
                        "chunk of {} values, expected {}; tensor sizes differ across ranks",
                        received.len(),
                        recv_range.len()
                    ),
                });
            }
            for (slot, value) in data[recv_range].iter_mut().zip(received) {
                *slot = op.combine(*slot, value);
            }
        }

        // --- Phase 2: All-Gather ---
        // Every rank now owns one fully reduced chunk; pass them around the ring.
        for step in 0..self.world_size - 1 {
            let send_range = chunk((self.rank + 1 + self.world_size - step) % self.world_size);
            self.send(Frame::Values(data[send_range].to_vec()), "allreduce")?;

            let received = self.recv_values("allreduce")?;
            let recv_range = chunk(self.chunk_index(step, 0));
            if received.len() != recv_range.len() {
                return Err(CollectiveError::Protocol {
                    rank: self.rank,
                    op: "allreduce",
                    detail: "reduced chunk has the wrong length".to_string(),
                });
            }
            data[recv_range].copy_from_slice(&received);
        }

        if op == ReduceOp::Average {
            let world = self.world_size as f64;
            data.iter_mut().for_each(|v| *v /= world);
        }
        Ok(data)
    }
}

impl fmt::Debug for CpuBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuBackend")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("local_size", &self.local_size)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl CollectiveBackend for CpuBackend {
    fn init(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            trace!(rank = self.rank, "cpu ring backend already initialized");
        } else {
            debug!(
                rank = self.rank,
                world_size = self.world_size,
                local_size = self.local_size,
                "cpu ring backend initialized"
            );
        }
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn local_rank(&self) -> usize {
        self.rank % self.local_size
    }

    fn size(&self) -> usize {
        self.world_size
    }

    fn local_size(&self) -> usize {
        self.local_size
    }

    fn join(&self, device: Option<usize>) -> Result<()> {
        self.ensure_initialized()?;
        trace!(rank = self.rank, ?device, "join");
        // The result of an all-reduce depends on every rank's contribution, so completing one
        // proves every rank has arrived.
        let joined = self.ring_allreduce(vec![1.0], ReduceOp::Sum)?;
        trace!(rank = self.rank, joined = joined[0], "join complete");
        Ok(())
    }

    fn allreduce<T: TensorElem>(&self, tensor: &Tensor<T>, op: ReduceOp) -> Result<Tensor<T>> {
        self.ensure_initialized()?;
        debug!(rank = self.rank, %op, elements = tensor.size(), "allreduce");
        let reduced = self.ring_allreduce(tensor.to_f64_vec()?, op)?;
        Ok(Tensor::from_f64(&reduced, tensor.shape())?.to_device(tensor.device()))
    }

    fn allgather<T: TensorElem>(&self, tensor: &Tensor<T>) -> Result<Vec<Tensor<T>>> {
        self.ensure_initialized()?;
        if tensor.rank() == 0 {
            return Err(TensorError::Unsupported(
                "allgather requires a tensor with at least one dimension".into(),
            )
            .into());
        }
        debug!(rank = self.rank, shape = ?tensor.shape(), "allgather");

        let w = self.world_size;
        let mut slots: Vec<Option<(Vec<usize>, Vec<f64>)>> = vec![None; w];
        slots[self.rank] = Some((tensor.shape().to_vec(), tensor.to_f64_vec()?));

        for step in 0..w - 1 {
            let send_idx = self.chunk_index(step, 0);
            let (shape, values) =
                slots[send_idx]
                    .clone()
                    .ok_or_else(|| CollectiveError::Protocol {
                        rank: self.rank,
                        op: "allgather",
                        detail: format!("slot {send_idx} empty at step {step}"),
                    })?;
            self.send(Frame::Tensor { shape, values }, "allgather")?;

            let received = self.recv_tensor("allgather")?;
            slots[self.chunk_index(step, 1)] = Some(received);
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(rank, slot)| {
                let (shape, values) = slot.ok_or_else(|| CollectiveError::Protocol {
                    rank: self.rank,
                    op: "allgather",
                    detail: format!("no tensor received from rank {rank}"),
                })?;
                Ok(Tensor::from_f64(&values, &shape)?.to_device(tensor.device()))
            })
            .collect()
    }

    fn broadcast<T: TensorElem>(&self, tensor: &Tensor<T>, root: usize) -> Result<Tensor<T>> {
        self.ensure_initialized()?;
        self.check_root(root)?;
        debug!(rank = self.rank, root, shape = ?tensor.shape(), "broadcast");

        let right = (self.rank + 1) % self.world_size;
        if self.rank == root {
            if right != root {
                let frame = Frame::Tensor {
                    shape: tensor.shape().to_vec(),
                    values: tensor.to_f64_vec()?,
                };
                self.send(frame, "broadcast")?;
            }
            return Ok(tensor.clone());
        }

        let (shape, values) = self.recv_tensor("broadcast")?;
        if right != root {
            let frame = Frame::Tensor {
                shape: shape.clone(),
                values: values.clone(),
            };
            self.send(frame, "broadcast")?;
        }
        Ok(Tensor::from_f64(&values, &shape)?.to_device(tensor.device()))
    }

    fn broadcast_bytes(&self, payload: Vec<u8>, root: usize) -> Result<Vec<u8>> {
        self.ensure_initialized()?;
        self.check_root(root)?;
        trace!(rank = self.rank, root, bytes = payload.len(), "broadcast_bytes");

        let right = (self.rank + 1) % self.world_size;
        if self.rank == root {
            if right != root {
                self.send(Frame::Bytes(payload.clone()), "broadcast_bytes")?;
            }
            return Ok(payload);
        }

        let received = self.recv_bytes("broadcast_bytes")?;
        if right != root {
            self.send(Frame::Bytes(received.clone()), "broadcast_bytes")?;
        }
        Ok(received)
    }
}
