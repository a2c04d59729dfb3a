//! End-to-end scenarios for the two-phase execution scheme.
//!
//! Drives complete section instances through the pipeline (first-phase
//! compilation, emission, patching, and the per-thread state machine) against a
//! mock machine, and checks the externally observable properties: memory effects
//! land exactly once, the descriptor-pointer slot is non-none exactly while a
//! thread is in the native phase, and aborts reach the application handler exactly
//! once.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use rseqgate::prelude::*;

struct MockMachine {
    registers: [u64; 16],
    slots: HashMap<u64, u64>,
}

impl MockMachine {
    fn new() -> Self {
        MockMachine {
            registers: [0; 16],
            slots: HashMap::new(),
        }
    }
}

impl MachineContext for MockMachine {
    fn register(&self, register: Register) -> u64 {
        self.registers[register.index()]
    }

    fn set_register(&mut self, register: Register, value: u64) {
        self.registers[register.index()] = value;
    }

    fn write_descriptor_slot(&mut self, offset: u64, value: u64) {
        self.slots.insert(offset, value);
    }

    fn read_descriptor_slot(&self, offset: u64) -> u64 {
        self.slots.get(&offset).copied().unwrap_or(0)
    }
}

/// Instrumentation that records every instruction address it observes.
#[derive(Default)]
struct CountingInstrumenter {
    observed: Mutex<Vec<u64>>,
}

impl Instrumenter for CountingInstrumenter {
    fn instrument(&self, instruction: &Instruction) -> Vec<ClientOp> {
        self.observed.lock().unwrap().push(instruction.address);
        vec![ClientOp {
            mnemonic: "observe",
            address: instruction.address,
            size: 6,
        }]
    }
}

const SLOT_OFFSET: u64 = 0x40;

fn store(address: u64) -> Instruction {
    Instruction {
        address,
        size: 4,
        mnemonic: "store",
        flow_type: FlowType::Sequential,
        operand: Operand::None,
        effects: EffectFlags::MEMORY_WRITE,
        reads: RegisterMask::of(&[Register::R1]),
        writes: RegisterMask::EMPTY,
    }
}

fn add(address: u64, target: Register) -> Instruction {
    Instruction {
        address,
        size: 4,
        mnemonic: "add",
        flow_type: FlowType::Sequential,
        operand: Operand::None,
        effects: EffectFlags::REGISTER_WRITE | EffectFlags::CONDITION_CODES,
        reads: RegisterMask::of(&[target]),
        writes: RegisterMask::of(&[target]),
    }
}

fn descriptor(start: u64, len: u64, abort: u64) -> SectionDescriptor {
    SectionDescriptor {
        version: DESCRIPTOR_VERSION,
        flags: DescriptorFlags::empty(),
        start,
        commit: start + len,
        abort,
    }
}

/// A section body of register work followed by two plain stores, the second
/// being the commit instruction.
fn section_blocks(start: u64) -> Vec<BasicBlock> {
    vec![BasicBlock::new(
        0,
        start,
        vec![
            add(start, Register::R3),
            store(start + 4),
            store(start + 8),
        ],
    )]
}

struct Pipeline {
    runtime: RseqRuntime,
    region: EmittedRegion,
    record: Arc<CriticalSectionRecord>,
}

fn build_pipeline(instrumenter: &dyn Instrumenter) -> Pipeline {
    let registry =
        SequenceRegistry::from_descriptors(vec![descriptor(0x1000, 12, 0x2000)]).unwrap();
    let runtime = RseqRuntime::with_registry(registry, RseqConfig::default());

    let mut region = runtime
        .compile_section(RegionId(1), 0x1000, &section_blocks(0x1000), instrumenter)
        .unwrap()
        .expect("section compiles protected");

    let record = PatchController::new(runtime.manager())
        .resolve(&mut region, 0x7F00_0000_2000)
        .unwrap();

    Pipeline {
        runtime,
        region,
        record,
    }
}

/// What happened while interpreting one instance of a region.
#[derive(Default, Debug)]
struct RunLog {
    memory_writes: Vec<u64>,
    instrumented: usize,
    handler_entries: usize,
    terminal: Option<SectionPhase>,
}

/// Interpret one execution of the section-ending region on the mock machine,
/// optionally aborting after `abort_after_native` native instructions.
fn run_instance(
    pipeline: &Pipeline,
    machine: &mut MockMachine,
    thread: &mut ThreadRuntimeState,
    slots: &mut RegisterCheckpointSlots,
    abort_after_native: Option<usize>,
) -> RunLog {
    let manager = pipeline.runtime.manager();
    let region = &pipeline.region;
    let mut log = RunLog::default();

    assert_eq!(machine.read_descriptor_slot(SLOT_OFFSET), 0);
    assert!(!thread.in_native_phase());

    let mut execution = SectionExecution::begin(region, slots, machine);

    // First phase: every op before the record load. Plain stores were elided, so
    // nothing writes memory here; instrumentation and register work still run.
    for op in &region.ops[..region.record_load()] {
        match op {
            EmittedOp::Client(_) => log.instrumented += 1,
            EmittedOp::App(instruction) => {
                assert!(
                    !instruction.is_plain_store(),
                    "plain store survived elision at {:#x}",
                    instruction.address
                );
                if instruction.effects.contains(EffectFlags::MEMORY_WRITE) {
                    log.memory_writes.push(instruction.address);
                }
                for register in instruction.writes.iter() {
                    machine.set_register(register, machine.register(register) + 1);
                }
            }
            other => panic!("unexpected op in first phase: {other:?}"),
        }

        // The slot stays clear for the whole instrumented pass.
        assert_eq!(machine.read_descriptor_slot(SLOT_OFFSET), 0);
    }

    execution.reach_commit().unwrap();
    execution
        .enter_native(manager, thread, slots, machine, SLOT_OFFSET)
        .unwrap();

    assert_eq!(
        machine.read_descriptor_slot(SLOT_OFFSET),
        pipeline.record.address()
    );
    assert!(thread.in_native_phase());

    // Second phase: the uninstrumented native copy, abortable at any point.
    let native = &region.ops[region.native_start()..region.inert_data()];
    for (index, op) in native.iter().enumerate() {
        if abort_after_native == Some(index) {
            let handler = execution
                .abort(manager, thread, machine, SLOT_OFFSET)
                .unwrap();
            assert_eq!(handler, region.descriptor.abort);
            log.handler_entries += 1;
            break;
        }

        let EmittedOp::NativeApp { instruction, .. } = op else {
            panic!("unexpected op in native copy: {op:?}");
        };

        assert!(thread.in_native_phase());
        if instruction.effects.contains(EffectFlags::MEMORY_WRITE) {
            log.memory_writes.push(instruction.address);
        }
        for register in instruction.writes.iter() {
            machine.set_register(register, machine.register(register) + 1);
        }
    }

    if !execution.phase().is_terminal() {
        execution
            .complete(manager, thread, machine, SLOT_OFFSET)
            .unwrap();
    }

    assert_eq!(machine.read_descriptor_slot(SLOT_OFFSET), 0);
    assert!(!thread.in_native_phase());

    log.terminal = Some(execution.phase());
    log
}

#[test]
fn natural_completion_observes_each_store_once() {
    let instrumenter = CountingInstrumenter::default();
    let pipeline = build_pipeline(&instrumenter);

    let mut machine = MockMachine::new();
    machine.set_register(Register::R3, 100);
    let mut thread = ThreadRuntimeState::new(ThreadId(1));
    let mut slots = RegisterCheckpointSlots::new();
    pipeline.runtime.manager().register_thread(ThreadId(1)).unwrap();

    let log = run_instance(&pipeline, &mut machine, &mut thread, &mut slots, None);

    assert_eq!(log.terminal, Some(SectionPhase::Completed));
    assert_eq!(log.handler_entries, 0);

    // Both plain stores landed exactly once, from the native copy.
    assert_eq!(log.memory_writes, vec![0x1004, 0x1008]);

    // Instrumentation saw all three body instructions, elided stores included.
    assert_eq!(log.instrumented, 3);
    assert_eq!(
        *instrumenter.observed.lock().unwrap(),
        vec![0x1000, 0x1004, 0x1008]
    );

    // R3 was incremented in the first phase, restored at the barrier, then
    // incremented once natively: one net increment survives.
    assert_eq!(machine.register(Register::R3), 101);
}

#[test]
fn abort_reaches_handler_exactly_once() {
    let instrumenter = CountingInstrumenter::default();
    let pipeline = build_pipeline(&instrumenter);

    let mut machine = MockMachine::new();
    let mut thread = ThreadRuntimeState::new(ThreadId(1));
    let mut slots = RegisterCheckpointSlots::new();
    pipeline.runtime.manager().register_thread(ThreadId(1)).unwrap();

    // Abort after the first native instruction, mid-copy.
    let log = run_instance(&pipeline, &mut machine, &mut thread, &mut slots, Some(1));

    assert_eq!(log.terminal, Some(SectionPhase::Aborted));
    assert_eq!(log.handler_entries, 1);

    // The aborted instance performed no store: the only write-capable native ops
    // came after the abort point.
    assert_eq!(log.memory_writes, Vec::<u64>::new());
}

#[test]
fn abort_then_clean_rerun() {
    let instrumenter = CountingInstrumenter::default();
    let pipeline = build_pipeline(&instrumenter);

    let mut machine = MockMachine::new();
    machine.set_register(Register::R3, 7);
    let mut thread = ThreadRuntimeState::new(ThreadId(1));
    let mut slots = RegisterCheckpointSlots::new();
    pipeline.runtime.manager().register_thread(ThreadId(1)).unwrap();

    let first = run_instance(&pipeline, &mut machine, &mut thread, &mut slots, Some(0));
    assert_eq!(first.terminal, Some(SectionPhase::Aborted));
    // The barrier restored the pre-entry value before the abort hit.
    assert_eq!(machine.register(Register::R3), 7);

    // Run two: no interruption. A stale checkpoint from run one would either
    // error out or restore the wrong values; neither happens.
    let second = run_instance(&pipeline, &mut machine, &mut thread, &mut slots, None);
    assert_eq!(second.terminal, Some(SectionPhase::Completed));
    assert_eq!(second.memory_writes, vec![0x1004, 0x1008]);
    assert_eq!(machine.register(Register::R3), 8);
}

#[test]
fn trampoline_carries_inert_handler_address() {
    let pipeline = build_pipeline(&NoInstrumentation);
    let region = &pipeline.region;

    // The handler address sits as inert data immediately before the trampoline
    // entry, and the record's abort address points at the entry, past the data.
    let EmittedOp::InertHandlerAddress { handler } = &region.ops[region.inert_data()] else {
        panic!("expected inert data");
    };
    assert_eq!(*handler, 0x2000);

    let base = pipeline.region.patch_info().unwrap().base;
    assert_eq!(
        pipeline.record.abort_cache(),
        region.op_address(base, region.trampoline_entry())
    );
    assert!(pipeline.record.abort_cache() > region.op_address(base, region.inert_data()));
}

#[test]
fn mid_body_entry_compiles_unprotected() {
    let registry =
        SequenceRegistry::from_descriptors(vec![descriptor(0x1000, 12, 0x2000)]).unwrap();
    let runtime = RseqRuntime::with_registry(registry, RseqConfig::default());

    let region = runtime
        .compile_section(RegionId(2), 0x1004, &section_blocks(0x1000), &NoInstrumentation)
        .unwrap();

    assert!(region.is_none());
    // A deliberate scope limitation, not a violation: the fallback stays off.
    assert!(!runtime.fallback().is_rejecting());
}

#[test]
fn indirect_branch_routes_to_fallback() {
    let registry =
        SequenceRegistry::from_descriptors(vec![descriptor(0x1000, 8, 0x2000)]).unwrap();
    let runtime = RseqRuntime::with_registry(registry, RseqConfig::default());

    let blocks = vec![BasicBlock::new(
        0,
        0x1000,
        vec![
            Instruction {
                address: 0x1000,
                size: 4,
                mnemonic: "jmpr",
                flow_type: FlowType::IndirectBranch,
                operand: Operand::None,
                effects: EffectFlags::empty(),
                reads: RegisterMask::of(&[Register::R2]),
                writes: RegisterMask::EMPTY,
            },
            store(0x1004),
        ],
    )];

    let region = runtime
        .compile_section(RegionId(3), 0x1000, &blocks, &NoInstrumentation)
        .unwrap();

    assert!(region.is_none());
    assert!(runtime.fallback().is_rejecting());
    // Once rejecting, the section is no longer offered for protection at all.
    assert!(runtime.section_at_start(0x1000).is_none());
}

#[test]
fn allocation_failure_abandons_region() {
    let registry =
        SequenceRegistry::from_descriptors(vec![descriptor(0x1000, 12, 0x2000)]).unwrap();
    let runtime = RseqRuntime::with_registry(
        registry,
        RseqConfig {
            max_live_records: Some(0),
            ..RseqConfig::default()
        },
    );

    let mut region = runtime
        .compile_section(RegionId(4), 0x1000, &section_blocks(0x1000), &NoInstrumentation)
        .unwrap()
        .expect("section compiles protected");

    let result = PatchController::new(runtime.manager()).resolve(&mut region, 0x5000);
    assert!(matches!(result, Err(Error::AllocationFailure)));

    // The region never references a record and the table holds nothing.
    assert!(region.patch_info().is_none());
    assert_eq!(runtime.manager().live_records(), 0);
}
