//! Data-parallel training over a Horovod-style collective backend.
//!
//! ## Lifecycle
//!
//! ```text
//! new ──► init backend
//! setup ─► model to device ─► (training?) ─► unwrap optimizers ─► lr × world
//!       ─► scheduler base lrs × world ─► broadcast params + optimizer state from rank 0
//!       ─► wrap optimizers ─► open skip-synchronize scope
//! backward ─► gradient closure ─► post_backward: backward_pass_completed ─► synchronize
//! optimizer_step ─► step (gradients already reduced)
//! teardown ─► close scope ─► join
//! ```
//!
//! While the scope is open, wrapped optimizers never synchronize on their own: `post_backward`
//! is the one place gradients are all-reduced.

use super::{ReduceOpArg, Reducible, Strategy};
use crate::config::StrategyConfig;
use crate::error::{Result, StrategyError};
use crate::host::{Interval, LrSchedulerConfig, TrainingHost};
use crate::rank_zero;
use crate::registry::StrategyRegistry;
use hvd_core::distributed::{
    broadcast_optimizer_state, broadcast_parameters, CollectiveBackend, DistributedOptimizer,
    ProcessGroup, SkipSynchronizeGuard,
};
use hvd_core::nn::Parameter;
use hvd_core::tensor::device::set_active_device;
use hvd_core::{Device, Module, Optimizer, Tensor, TensorElem};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Registry name of [`HorovodStrategy`].
pub const STRATEGY_NAME: &str = "horovod";

/// Open skip-synchronize guards, one per wrapped optimizer.
///
/// Guards are released in reverse order of opening when the stack is dropped, whichever way
/// the owner goes out of scope.
#[derive(Default)]
pub struct SyncScopeStack {
    guards: Vec<SkipSynchronizeGuard>,
}

impl SyncScopeStack {
    pub fn push(&mut self, guard: SkipSynchronizeGuard) {
        self.guards.push(guard);
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

impl Drop for SyncScopeStack {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

impl fmt::Debug for SyncScopeStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncScopeStack")
            .field("guards", &self.guards.len())
            .finish()
    }
}

/// Data-parallel strategy: one replica per rank, gradients averaged by all-reduce.
pub struct HorovodStrategy<T: TensorElem, B: CollectiveBackend> {
    backend: B,
    config: StrategyConfig,
    parallel_devices: Vec<Device>,
    model: Option<Arc<dyn Module<T>>>,
    optimizers: Vec<Box<dyn Optimizer<T>>>,
    lr_scheduler_configs: Vec<LrSchedulerConfig>,
    exit_stack: Option<SyncScopeStack>,
}

impl<T, B> HorovodStrategy<T, B>
where
    T: TensorElem,
    B: CollectiveBackend + Clone + 'static,
{
    /// Initializes `backend` (a no-op if it already is) and binds this rank's devices.
    pub fn new(backend: B, config: StrategyConfig) -> Result<Self> {
        backend.init()?;
        rank_zero::set_rank(backend.rank());

        let parallel_devices = config.resolve_devices(backend.local_size());
        crate::rank_zero_info!(
            world_size = backend.size(),
            local_size = backend.local_size(),
            devices = ?parallel_devices,
            "horovod strategy initialized"
        );
        Ok(Self {
            backend,
            config,
            parallel_devices,
            model: None,
            optimizers: Vec::new(),
            lr_scheduler_configs: Vec::new(),
            exit_stack: None,
        })
    }

    /// Registers this strategy under [`STRATEGY_NAME`].
    pub fn register_strategies(registry: &mut StrategyRegistry<T, B>) -> Result<()> {
        registry.register(
            STRATEGY_NAME,
            Self::construct,
            "Data-parallel training with gradient all-reduce",
            false,
        )
    }

    fn construct(backend: B, config: &StrategyConfig) -> Result<Box<dyn Strategy<T>>> {
        Ok(Box::new(Self::new(backend, config.clone())?))
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    /// Whether the skip-synchronize scope is open.
    pub fn sync_scope_open(&self) -> bool {
        self.exit_stack.is_some()
    }

    /// Wraps `optimizer` so its gradients are all-reduced, unless it already is.
    ///
    /// Only the pairs of `named_parameters` that `optimizer` updates are synchronized by it.
    pub fn wrap_optimizer(
        &self,
        mut optimizer: Box<dyn Optimizer<T>>,
        backward_passes_per_step: usize,
        named_parameters: &[(String, Parameter<T>)],
    ) -> Box<dyn Optimizer<T>> {
        if optimizer.as_synchronized().is_some() {
            debug!("optimizer already synchronizes gradients; not wrapping again");
            return optimizer;
        }
        let owned = optimizer.param_ids();
        let filtered: Vec<(String, Parameter<T>)> = named_parameters
            .iter()
            .filter(|(_, p)| owned.contains(&p.id()))
            .cloned()
            .collect();
        Box::new(DistributedOptimizer::new(
            optimizer,
            self.backend.clone(),
            backward_passes_per_step,
            filtered,
        ))
    }

    /// Backend join, hinted with the local rank when this rank drives an accelerator.
    fn join(&self) -> Result<()> {
        let on_accelerator = self.root_device().is_ok_and(|d| d.is_accelerator());
        self.backend.join(on_accelerator.then(|| self.local_rank()))?;
        Ok(())
    }

    fn check_group(op: &'static str, group: Option<&ProcessGroup>) -> Result<()> {
        match group {
            None | Some(ProcessGroup::World) => Ok(()),
            Some(group) => Err(StrategyError::UnsupportedGroup {
                op,
                group: group.clone(),
            }),
        }
    }

    fn open_sync_scope(&mut self) {
        // Release any scope from an earlier setup before opening the new one.
        self.exit_stack = None;
        let mut stack = SyncScopeStack::default();
        for optimizer in &mut self.optimizers {
            if let Some(synced) = optimizer.as_synchronized() {
                stack.push(synced.skip_synchronize());
            }
        }
        debug!(guards = stack.len(), "skip-synchronize scope opened");
        self.exit_stack = Some(stack);
    }
}

impl<T, B> Strategy<T> for HorovodStrategy<T, B>
where
    T: TensorElem,
    B: CollectiveBackend + Clone + 'static,
{
    fn name(&self) -> &'static str {
        STRATEGY_NAME
    }

    fn global_rank(&self) -> usize {
        self.backend.rank()
    }

    fn local_rank(&self) -> usize {
        self.backend.local_rank()
    }

    fn world_size(&self) -> usize {
        self.backend.size()
    }

    fn parallel_devices(&self) -> &[Device] {
        &self.parallel_devices
    }

    fn root_device(&self) -> Result<Device> {
        let local_rank = self.local_rank();
        self.parallel_devices
            .get(local_rank)
            .copied()
            .ok_or(StrategyError::DeviceIndexOutOfRange {
                local_rank,
                available: self.parallel_devices.len(),
            })
    }

    fn handles_gradient_accumulation(&self) -> bool {
        true
    }

    fn root_rank(&self) -> usize {
        self.config.root_rank
    }

    fn connect(&mut self, model: Arc<dyn Module<T>>) {
        self.model = Some(model);
    }

    fn model(&self) -> Option<Arc<dyn Module<T>>> {
        self.model.clone()
    }

    fn model_to_device(&mut self) -> Result<()> {
        let device = self.root_device()?;
        if device.is_accelerator() {
            set_active_device(device);
        }
        if let Some(model) = &self.model {
            model.to_device(device);
        }
        Ok(())
    }

    fn setup(&mut self, host: &dyn TrainingHost<T>) -> Result<()> {
        self.model_to_device()?;

        if !host.is_training() {
            return Ok(());
        }

        let model = self.model.clone().ok_or_else(|| {
            StrategyError::Misconfiguration("setup() called before connect()".into())
        })?;
        let config = host.configure_optimizers(model.as_ref())?;
        let mut optimizers: Vec<Box<dyn Optimizer<T>>> = config
            .optimizers
            .into_iter()
            .map(|opt| opt.into_inner())
            .collect();
        let mut lr_scheduler_configs = config.lr_schedulers;

        // Linear scaling: W ranks consume W times the samples per step.
        let world = self.world_size() as f64;
        for optimizer in &mut optimizers {
            for group in optimizer.param_groups_mut() {
                group.lr *= world;
            }
        }
        for config in &mut lr_scheduler_configs {
            if let Some(base_lrs) = config.scheduler.base_lrs_mut() {
                base_lrs.iter_mut().for_each(|lr| *lr *= world);
            }
        }

        let named_parameters = model.named_parameters();
        broadcast_parameters(&self.backend, &named_parameters, 0)?;
        for optimizer in &mut optimizers {
            broadcast_optimizer_state(&self.backend, optimizer.as_mut(), 0)?;
        }

        let passes = host.accumulate_grad_batches();
        self.optimizers = optimizers
            .into_iter()
            .map(|opt| self.wrap_optimizer(opt, passes, &named_parameters))
            .collect();
        self.lr_scheduler_configs = lr_scheduler_configs;
        self.open_sync_scope();

        crate::rank_zero_info!(
            optimizers = self.optimizers.len(),
            schedulers = self.lr_scheduler_configs.len(),
            backward_passes_per_step = passes,
            lr_scale = world,
            "setup complete"
        );
        Ok(())
    }

    fn optimizers(&self) -> &[Box<dyn Optimizer<T>>] {
        &self.optimizers
    }

    fn lr_scheduler_configs(&self) -> &[LrSchedulerConfig] {
        &self.lr_scheduler_configs
    }

    fn backward(
        &mut self,
        loss: &Tensor<T>,
        closure: &mut dyn FnMut(&Tensor<T>) -> Result<()>,
    ) -> Result<()> {
        closure(loss)?;
        self.post_backward(loss)
    }

    fn post_backward(&mut self, _loss: &Tensor<T>) -> Result<()> {
        for optimizer in &mut self.optimizers {
            if let Some(synced) = optimizer.as_synchronized() {
                synced.backward_pass_completed()?;
                synced.synchronize()?;
            }
        }
        Ok(())
    }

    fn optimizer_step(&mut self, optimizer_idx: usize) -> Result<()> {
        let count = self.optimizers.len();
        let optimizer = self.optimizers.get_mut(optimizer_idx).ok_or_else(|| {
            StrategyError::Misconfiguration(format!(
                "optimizer index {optimizer_idx} out of range for {count} optimizers"
            ))
        })?;
        optimizer.step()?;
        Ok(())
    }

    fn zero_grad(&mut self) {
        for optimizer in &mut self.optimizers {
            optimizer.zero_grad();
        }
    }

    fn lr_scheduler_step(&mut self, interval: Interval, metric: Option<f64>) -> Result<()> {
        for config in &mut self.lr_scheduler_configs {
            if !config.tick(interval) {
                continue;
            }
            let count = self.optimizers.len();
            let optimizer = self.optimizers.get_mut(config.optimizer_idx).ok_or_else(|| {
                StrategyError::Misconfiguration(format!(
                    "scheduler targets optimizer {} but only {count} exist",
                    config.optimizer_idx
                ))
            })?;
            let lrs = config.scheduler.step(&optimizer.lrs(), metric);
            for (group, lr) in optimizer.param_groups_mut().iter_mut().zip(lrs) {
                group.lr = lr;
            }
        }
        Ok(())
    }

    fn barrier(&self, name: Option<&str>) -> Result<()> {
        if self.backend.is_distributed() {
            debug!(name, "barrier");
            self.join()?;
        }
        Ok(())
    }

    fn reduce(
        &self,
        value: Reducible<T>,
        group: Option<&ProcessGroup>,
        reduce_op: ReduceOpArg,
    ) -> Result<Reducible<T>> {
        Self::check_group("reduce", group)?;
        let op = reduce_op.resolve()?;

        // Every rank must arrive before any rank observes the result.
        self.join()?;

        match value {
            Reducible::Tensor(tensor) => {
                Ok(Reducible::Tensor(self.backend.allreduce(&tensor, op)?))
            }
            other => Ok(other),
        }
    }

    fn all_gather(
        &self,
        tensor: &Tensor<T>,
        group: Option<&ProcessGroup>,
        _sync_grads: bool,
    ) -> Result<Vec<Tensor<T>>> {
        Self::check_group("all_gather", group)?;

        let tensor = if tensor.rank() == 0 {
            tensor.clone().reshape(&[1])?
        } else {
            tensor.clone()
        };

        self.join()?;
        Ok(self.backend.allgather(&tensor)?)
    }

    fn broadcast_bytes(&self, payload: Vec<u8>, src: usize) -> Result<Vec<u8>> {
        Ok(self.backend.broadcast_bytes(payload, src)?)
    }

    fn teardown(&mut self) -> Result<()> {
        if let Some(stack) = self.exit_stack.take() {
            debug!(guards = stack.len(), "closing skip-synchronize scope");
            drop(stack);
        }

        // No rank returns to the host before every rank is done.
        let joined = self.join();

        if let Some(model) = &self.model {
            if self.root_device().is_ok_and(|d| d.is_accelerator()) {
                model.to_device(Device::Cpu);
            }
        }
        self.optimizers.clear();
        self.lr_scheduler_configs.clear();
        joined?;
        info!(rank = self.global_rank(), "teardown complete");
        Ok(())
    }
}

impl<T: TensorElem, B: CollectiveBackend> fmt::Debug for HorovodStrategy<T, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HorovodStrategy")
            .field("rank", &self.backend.rank())
            .field("world_size", &self.backend.size())
            .field("parallel_devices", &self.parallel_devices)
            .field("optimizers", &self.optimizers.len())
            .field("exit_stack", &self.exit_stack)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{DistributedSamplerKwargs, OptimizerConfig};
    use hvd_core::distributed::backend;
    use hvd_core::distributed::ReduceOp;
    use hvd_core::optim::{ReduceLrOnPlateau, Sgd};
    use hvd_core::distributed::CollectiveError;
    use hvd_core::tensor::device::active_device;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// A fake world where every other rank holds the same values as this one.
    #[derive(Clone)]
    struct RecordingBackend {
        rank: usize,
        local_rank: usize,
        size: usize,
        calls: Arc<Mutex<Vec<String>>>,
        fail_join: Arc<AtomicBool>,
    }

    impl RecordingBackend {
        fn new(rank: usize, size: usize) -> Self {
            Self {
                rank,
                local_rank: rank,
                size,
                calls: Arc::default(),
                fail_join: Arc::default(),
            }
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    impl CollectiveBackend for RecordingBackend {
        fn init(&self) -> backend::Result<()> {
            self.record("init");
            Ok(())
        }
        fn is_initialized(&self) -> bool {
            true
        }
        fn rank(&self) -> usize {
            self.rank
        }
        fn local_rank(&self) -> usize {
            self.local_rank
        }
        fn size(&self) -> usize {
            self.size
        }
        fn local_size(&self) -> usize {
            self.size
        }
        fn join(&self, device: Option<usize>) -> backend::Result<()> {
            self.record(format!("join({device:?})"));
            if self.fail_join.load(Ordering::SeqCst) {
                return Err(CollectiveError::Disconnected {
                    rank: self.rank,
                    op: "join",
                });
            }
            Ok(())
        }
        fn allreduce<U: TensorElem>(
            &self,
            tensor: &Tensor<U>,
            op: ReduceOp,
        ) -> backend::Result<Tensor<U>> {
            self.record(format!("allreduce({op})"));
            let factor = if op == ReduceOp::Sum { self.size as f64 } else { 1.0 };
            let values: Vec<f64> = tensor.to_f64_vec()?.iter().map(|v| v * factor).collect();
            Ok(Tensor::from_f64(&values, tensor.shape())?)
        }
        fn allgather<U: TensorElem>(&self, tensor: &Tensor<U>) -> backend::Result<Vec<Tensor<U>>> {
            self.record("allgather");
            Ok(vec![tensor.clone(); self.size])
        }
        fn broadcast<U: TensorElem>(
            &self,
            tensor: &Tensor<U>,
            _root: usize,
        ) -> backend::Result<Tensor<U>> {
            self.record("broadcast");
            Ok(tensor.clone())
        }
        fn broadcast_bytes(&self, payload: Vec<u8>, _root: usize) -> backend::Result<Vec<u8>> {
            self.record("broadcast_bytes");
            Ok(payload)
        }
    }

    #[derive(Debug)]
    struct TinyModel {
        weight: Parameter<f64>,
        bias: Parameter<f64>,
    }

    impl TinyModel {
        fn new() -> Self {
            Self {
                weight: Parameter::new(Tensor::ones(&[2])),
                bias: Parameter::new(Tensor::zeros(&[1])),
            }
        }
    }

    impl Module<f64> for TinyModel {
        fn named_parameters(&self) -> Vec<(String, Parameter<f64>)> {
            vec![
                ("weight".to_string(), self.weight.clone()),
                ("bias".to_string(), self.bias.clone()),
            ]
        }
    }

    struct Host {
        training: bool,
        passes: usize,
        model: Arc<TinyModel>,
    }

    impl TrainingHost<f64> for Host {
        fn is_training(&self) -> bool {
            self.training
        }

        fn accumulate_grad_batches(&self) -> usize {
            self.passes
        }

        fn configure_optimizers(&self, _model: &dyn Module<f64>) -> Result<OptimizerConfig<f64>> {
            Ok(OptimizerConfig::new()
                .with_optimizer(Sgd::new(vec![self.model.weight.clone()], 0.1))
                .with_optimizer(Sgd::new(vec![self.model.bias.clone()], 0.2))
                .with_scheduler(LrSchedulerConfig::new(
                    hvd_core::optim::LinearWarmup::new(vec![0.1], 0, 10),
                ))
                .with_scheduler(
                    LrSchedulerConfig::new(ReduceLrOnPlateau::new(0.5, 0)).with_optimizer_idx(1),
                ))
        }
    }

    fn strategy(
        rank: usize,
        size: usize,
        devices: Vec<Device>,
    ) -> (HorovodStrategy<f64, RecordingBackend>, RecordingBackend) {
        let backend = RecordingBackend::new(rank, size);
        let strategy = HorovodStrategy::new(backend.clone(), StrategyConfig::new(devices)).unwrap();
        (strategy, backend)
    }

    fn host(model: &Arc<TinyModel>, passes: usize) -> Host {
        Host {
            training: true,
            passes,
            model: Arc::clone(model),
        }
    }

    #[test]
    fn test_new_initializes_backend() {
        let (strategy, backend) = strategy(0, 2, vec![]);
        assert_eq!(backend.calls(), vec!["init"]);
        assert_eq!(strategy.parallel_devices(), &[Device::Cpu, Device::Cpu]);
        assert!(strategy.handles_gradient_accumulation());
        assert_eq!(
            strategy.distributed_sampler_kwargs(),
            DistributedSamplerKwargs {
                num_replicas: 2,
                rank: 0
            }
        );
    }

    #[test]
    fn test_root_device_out_of_range() {
        let (strategy, _) = strategy(1, 2, vec![Device::Cuda(0)]);
        let err = strategy.root_device().unwrap_err();
        assert!(matches!(
            err,
            StrategyError::DeviceIndexOutOfRange {
                local_rank: 1,
                available: 1
            }
        ));
    }

    #[test]
    fn test_setup_order_and_scaling() {
        let model = Arc::new(TinyModel::new());
        let (mut strategy, backend) = strategy(0, 4, vec![]);
        strategy.connect(model.clone());
        strategy.setup(&host(&model, 1)).unwrap();

        let lrs: Vec<Vec<f64>> = strategy.optimizers().iter().map(|o| o.lrs()).collect();
        assert!((lrs[0][0] - 0.4).abs() < 1e-12);
        assert!((lrs[1][0] - 0.8).abs() < 1e-12);

        let configs = strategy.lr_scheduler_configs();
        assert_eq!(configs[0].scheduler.base_lrs(), Some(&[0.4][..]));
        assert!(configs[1].scheduler.base_lrs().is_none());

        // Parameters in name order, then one state broadcast per optimizer.
        assert_eq!(
            backend.calls(),
            vec!["init", "broadcast", "broadcast", "broadcast_bytes", "broadcast_bytes"]
        );
        assert!(strategy.sync_scope_open());
    }

    #[test]
    fn test_setup_without_training_only_moves_model() {
        let model = Arc::new(TinyModel::new());
        let (mut strategy, backend) = strategy(1, 2, vec![Device::Cuda(0), Device::Cuda(1)]);
        strategy.connect(model.clone());
        let mut host = host(&model, 1);
        host.training = false;
        strategy.setup(&host).unwrap();

        assert_eq!(model.weight.device(), Device::Cuda(1));
        assert_eq!(active_device(), Some(Device::Cuda(1)));
        assert!(strategy.optimizers().is_empty());
        assert!(!strategy.sync_scope_open());
        assert_eq!(backend.calls(), vec!["init"]);
    }

    #[test]
    fn test_setup_requires_model() {
        let model = Arc::new(TinyModel::new());
        let (mut strategy, _) = strategy(0, 1, vec![]);
        let err = strategy.setup(&host(&model, 1)).unwrap_err();
        assert!(err.is_misconfiguration());
    }

    #[test]
    fn test_wrap_is_idempotent() {
        let model = Arc::new(TinyModel::new());
        let (strategy, _) = strategy(0, 2, vec![]);
        let named = model.named_parameters();

        let raw: Box<dyn Optimizer<f64>> = Box::new(Sgd::new(vec![model.weight.clone()], 0.1));
        let mut once = strategy.wrap_optimizer(raw, 1, &named);
        assert!(once.as_synchronized().is_some());
        let address = once.as_ref() as *const dyn Optimizer<f64> as *const ();

        let twice = strategy.wrap_optimizer(once, 1, &named);
        assert_eq!(
            twice.as_ref() as *const dyn Optimizer<f64> as *const (),
            address
        );
    }

    #[test]
    fn test_backward_synchronizes_once_per_window() {
        let model = Arc::new(TinyModel::new());
        let (mut strategy, backend) = strategy(0, 2, vec![]);
        strategy.connect(model.clone());
        strategy.setup(&host(&model, 2)).unwrap();
        let before = backend.calls().len();

        let weight = model.weight.clone();
        let mut closure = |_: &Tensor<f64>| -> Result<()> {
            weight.accumulate_grad(&Tensor::ones(&[2]))?;
            Ok(())
        };
        let loss = Tensor::scalar(1.0);

        strategy.backward(&loss, &mut closure).unwrap();
        assert_eq!(backend.calls().len(), before, "first micro-batch only accumulates");

        strategy.backward(&loss, &mut closure).unwrap();
        let reduced: Vec<_> = backend.calls()[before..].to_vec();
        // One all-reduce per optimizer (each owns one parameter).
        assert_eq!(reduced, vec!["allreduce(mean)", "allreduce(mean)"]);

        strategy.optimizer_step(0).unwrap();
        assert_eq!(backend.calls().len(), before + 2, "step does not reduce again");
        // 1.0 - (0.1 * 2) * 2.0 accumulated
        assert!((model.weight.value().data()[0] - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_post_backward_alone_synchronizes() {
        let model = Arc::new(TinyModel::new());
        let (mut strategy, backend) = strategy(0, 2, vec![]);
        strategy.connect(model.clone());
        strategy.setup(&host(&model, 1)).unwrap();
        let before = backend.calls().len();

        model.weight.set_grad(Some(Tensor::ones(&[2])));
        strategy.post_backward(&Tensor::scalar(1.0)).unwrap();
        assert_eq!(
            backend.calls()[before..],
            ["allreduce(mean)", "allreduce(mean)"]
        );

        strategy.optimizer_step(0).unwrap();
        assert_eq!(backend.calls().len(), before + 2);
    }

    #[test]
    fn test_drop_without_teardown_closes_scope() {
        let model = Arc::new(TinyModel::new());
        let (mut strategy, _) = strategy(0, 2, vec![]);
        strategy.connect(model.clone());
        strategy.setup(&host(&model, 1)).unwrap();

        let mut optimizers = std::mem::take(&mut strategy.optimizers);
        assert!(optimizers[0].as_synchronized().unwrap().is_skipping());

        drop(strategy);
        assert!(!optimizers[0].as_synchronized().unwrap().is_skipping());
        assert!(!optimizers[1].as_synchronized().unwrap().is_skipping());
    }

    #[test]
    fn test_teardown_releases_state_when_join_fails() {
        let model = Arc::new(TinyModel::new());
        let (mut strategy, backend) = strategy(0, 2, vec![Device::Cuda(0), Device::Cuda(1)]);
        strategy.connect(model.clone());
        strategy.setup(&host(&model, 1)).unwrap();
        assert_eq!(model.weight.device(), Device::Cuda(0));

        backend.fail_join.store(true, Ordering::SeqCst);
        let err = strategy.teardown().unwrap_err();
        assert!(matches!(
            err,
            StrategyError::Core(hvd_core::Error::Collective(CollectiveError::Disconnected { .. }))
        ));
        assert!(strategy.optimizers().is_empty());
        assert!(strategy.lr_scheduler_configs().is_empty());
        assert!(!strategy.sync_scope_open());
        assert_eq!(model.weight.device(), Device::Cpu);
    }

    #[test]
    fn test_lr_scheduler_step() {
        let model = Arc::new(TinyModel::new());
        let (mut strategy, _) = strategy(0, 2, vec![]);
        strategy.connect(model.clone());
        strategy.setup(&host(&model, 1)).unwrap();

        strategy.lr_scheduler_step(Interval::Step, None).unwrap();
        assert!((strategy.optimizers()[0].lrs()[0] - 0.2).abs() < 1e-12);

        strategy.lr_scheduler_step(Interval::Epoch, Some(1.0)).unwrap();
        // Linear decay from the scaled base rate 0.2: one tenth of the way down.
        assert!((strategy.optimizers()[0].lrs()[0] - 0.18).abs() < 1e-12);
        assert!((strategy.optimizers()[1].lrs()[0] - 0.4).abs() < 1e-12);

        strategy.lr_scheduler_step(Interval::Epoch, Some(1.0)).unwrap();
        assert!((strategy.optimizers()[1].lrs()[0] - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_barrier_skipped_for_single_rank() {
        let (single, backend) = strategy(0, 1, vec![]);
        single.barrier(Some("epoch_end")).unwrap();
        assert_eq!(backend.calls(), vec!["init"]);

        let (multi, backend) = strategy(0, 2, vec![Device::Cuda(0), Device::Cuda(1)]);
        multi.barrier(None).unwrap();
        assert_eq!(backend.calls(), vec!["init", "join(Some(0))"]);
    }

    #[test]
    fn test_reduce_validates_before_collectives() {
        let (strategy, backend) = strategy(0, 3, vec![]);
        let t = Reducible::Tensor(Tensor::scalar(2.0));

        let err = strategy
            .reduce(t.clone(), Some(&ProcessGroup::Ranks(vec![0, 1])), ReduceOpArg::Default)
            .unwrap_err();
        assert!(matches!(err, StrategyError::UnsupportedGroup { op: "reduce", .. }));

        let err = strategy
            .reduce(t.clone(), None, "median".into())
            .unwrap_err();
        assert!(matches!(err, StrategyError::UnrecognizedReduceOp(_)));
        assert_eq!(backend.calls(), vec!["init"]);

        let summed = strategy.reduce(t, Some(&ProcessGroup::World), "sum".into()).unwrap();
        assert_eq!(summed.into_tensor().unwrap().data(), &[6.0]);
        assert_eq!(backend.calls()[1..], ["join(None)", "allreduce(sum)"]);
    }

    #[test]
    fn test_reduce_passes_values_through() {
        let (strategy, backend) = strategy(0, 2, vec![]);
        let value = serde_json::json!({"lr": 0.1});
        let out = strategy
            .reduce(Reducible::Value(value.clone()), None, ReduceOpArg::Default)
            .unwrap();
        assert_eq!(out, Reducible::Value(value));
        assert!(!backend.calls().iter().any(|c| c.starts_with("allreduce")));
    }

    #[test]
    fn test_all_gather_reshapes_scalars() {
        let (strategy, _) = strategy(0, 3, vec![]);
        let gathered = strategy.all_gather(&Tensor::scalar(5.0), None, false).unwrap();
        assert_eq!(gathered.len(), 3);
        assert!(gathered.iter().all(|t| t.shape() == [1]));

        let err = strategy
            .all_gather(&Tensor::scalar(5.0), Some(&ProcessGroup::Ranks(vec![1])), true)
            .unwrap_err();
        assert!(err.is_misconfiguration());
    }

    #[test]
    fn test_teardown_without_setup_still_joins() {
        let (mut strategy, backend) = strategy(0, 2, vec![]);
        strategy.teardown().unwrap();
        strategy.teardown().unwrap();
        assert_eq!(backend.calls(), vec!["init", "join(None)", "join(None)"]);
    }

    #[test]
    fn test_teardown_closes_scope() {
        let model = Arc::new(TinyModel::new());
        let (mut strategy, _) = strategy(0, 2, vec![]);
        strategy.connect(model.clone());
        strategy.setup(&host(&model, 1)).unwrap();

        let mut optimizers = std::mem::take(&mut strategy.optimizers);
        assert!(optimizers[0].as_synchronized().unwrap().is_skipping());

        strategy.teardown().unwrap();
        assert!(!strategy.sync_scope_open());
        assert!(!optimizers[0].as_synchronized().unwrap().is_skipping());
        assert!(!optimizers[1].as_synchronized().unwrap().is_skipping());
    }

    #[test]
    fn test_registration() {
        let mut registry = StrategyRegistry::<f64, RecordingBackend>::new();
        HorovodStrategy::register_strategies(&mut registry).unwrap();
        assert!(registry.contains(STRATEGY_NAME));
        assert!(HorovodStrategy::register_strategies(&mut registry).is_err());

        let created = registry
            .create(STRATEGY_NAME, RecordingBackend::new(0, 1), &StrategyConfig::default())
            .unwrap();
        assert_eq!(created.name(), "horovod");
    }
}
