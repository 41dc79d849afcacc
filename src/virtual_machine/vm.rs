//! Core virtual machine implementation.
//!
//! The [`Machine`] executes the instructions of its active module against an
//! evaluation stack of untagged [`Word`]s. Pool allocations live on a second,
//! separate stack. All integer arithmetic uses wrapping semantics.
//!
//! Every handler checks its preconditions before touching any state, so a
//! failed [`Machine::step`] leaves the stacks, the guest heap and the module
//! table as they were. Only the program counter has already moved past the
//! faulting instruction.

pub mod heap;
pub mod stack;

use crate::types::word::Word;
use crate::virtual_machine::errors::VmError;
use crate::virtual_machine::interrupts::{HostIo, InterruptTable};
use crate::virtual_machine::isa::Opcode;
use crate::virtual_machine::linker::DynamicLinker;
use crate::virtual_machine::module::{Instruction, MemorySegment, Module};
use crate::{info, warn};
use heap::Heap;
use stack::{Stack, StackKind};

/// Capacities of a machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MachineConfig {
    /// Evaluation stack slots.
    pub stack_capacity: usize,
    /// Pool-allocation stack slots.
    pub pool_capacity: usize,
    /// Module table slots, the bootstrap module included.
    pub module_capacity: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            stack_capacity: 1024,
            pool_capacity: 1024,
            module_capacity: 64,
        }
    }
}

macro_rules! exec_vm {
    // Entry point
    (
        vm = $vm:ident,
        instr = $instr:ident,
        { $( $variant:ident => $handler:ident $args:tt ),* $(,)? }
    ) => {{
        match $instr.opcode()? {
            $(
                Opcode::$variant => exec_vm!(@call $vm, $instr, $handler, $args),
            )*
        }
    }};

    // Handler taking decoded operands
    (@call $vm:ident, $instr:ident, $handler:ident,
        ( $( $field:ident : $kind:ident ),* $(,)? )
    ) => {{
        $( let $field = exec_vm!(@read $instr, $kind); )*
        $vm.$handler($( $field ),*)
    }};

    // Family handler taking the operation itself
    (@call $vm:ident, $instr:ident, $handler:ident, [ $( $arg:expr ),* $(,)? ]) => {{
        $vm.$handler($( $arg ),*)
    }};

    // Immediate Word, pushed as is
    (@read $instr:ident, Imm) => {{
        $instr.operand
    }};

    // Every other operand kind is an unsigned index, offset or width
    (@read $instr:ident, $kind:ident) => {{
        $instr.operand.as_u64()
    }};
}

fn int_zero(divisor: Word) -> bool {
    divisor.is_zero()
}

fn float_zero(divisor: Word) -> bool {
    divisor.as_f64() == 0.0
}

/// IEEE 754 remainder: `x - n * y` with `n` the integer nearest `x / y`,
/// ties to even.
fn ieee_remainder(x: f64, y: f64) -> f64 {
    let r = x % y;
    let half = y.abs() / 2.0;
    if r.abs() > half || (r.abs() == half && ((x - r) / y).rem_euclid(2.0) != 0.0) {
        r - y.abs().copysign(r)
    } else {
        r
    }
}

/// Stack virtual machine.
///
/// Module 0 is the bootstrap module and stays loaded for the machine's
/// lifetime. Further modules are linked at run time through the
/// [`DynamicLinker`]; their slots are never reused, so a module index stays
/// meaningful after its module is unloaded.
pub struct Machine<'t> {
    stack: Stack<Word>,
    pools: Stack<u64>,
    pc: u64,
    active: usize,
    modules: Vec<Option<Module>>,
    heap: Heap,
    io: HostIo,
    linker: DynamicLinker,
    interrupts: &'t InterruptTable,
    config: MachineConfig,
    steps: u64,
}

impl<'t> Machine<'t> {
    /// Creates a machine that starts in `module` at its entry point.
    ///
    /// Returns `IllegalEntryPoint` if the entry point lies outside the
    /// module's instructions.
    pub fn new(
        module: Module,
        interrupts: &'t InterruptTable,
        linker: DynamicLinker,
        config: MachineConfig,
    ) -> Result<Self, VmError> {
        if !module.contains(module.entry_point) {
            return Err(VmError::IllegalEntryPoint {
                entry: module.entry_point,
                program_size: module.len(),
            });
        }

        let mut machine = Self {
            stack: Stack::new(config.stack_capacity, StackKind::Evaluation),
            pools: Stack::new(config.pool_capacity, StackKind::Pool),
            pc: module.entry_point,
            active: 0,
            modules: Vec::new(),
            heap: Heap::new(),
            io: HostIo::new(),
            linker,
            interrupts,
            config,
            steps: 0,
        };
        let module = machine.install(module);
        machine.modules.push(Some(module));
        Ok(machine)
    }

    /// Replaces the host file table.
    pub fn with_io(mut self, io: HostIo) -> Self {
        self.io = io;
        self
    }

    /// Executes the next instruction.
    pub fn step(&mut self) -> Result<(), VmError> {
        let instruction = self.fetch()?;
        self.pc += 1;
        self.steps += 1;
        self.exec(instruction)
    }

    /// Steps until the machine halts and returns the reason.
    pub fn run(&mut self) -> VmError {
        let halt = loop {
            if let Err(err) = self.step() {
                break err;
            }
        };
        match &halt {
            VmError::Exit(code) => {
                info!("machine exited with code {code} after {} steps", self.steps)
            }
            err => warn!(
                "machine halted after {} steps: {} ({err})",
                self.steps,
                err.status().name()
            ),
        }
        halt
    }

    fn fetch(&self) -> Result<Instruction, VmError> {
        let module = self.active_module()?;
        usize::try_from(self.pc)
            .ok()
            .and_then(|pc| module.instructions.get(pc))
            .copied()
            .ok_or(VmError::IllegalAccess)
    }

    fn exec(&mut self, instruction: Instruction) -> Result<(), VmError> {
        exec_vm! {
            vm = self,
            instr = instruction,
            {
                // Stack and pool memory
                Nop => op_nop(),
                Push => op_push(value: Imm),
                Pop => op_pop(),
                Load => op_load(offset: Offset),
                Store => op_store(offset: Offset),
                MallocPool => op_malloc_pool(key: Key),
                FreePool => op_free_pool(),
                PushPtr => op_push_ptr(offset: Offset),
                LoadPtr => op_load_ptr(width: Width),
                StorePtr => op_store_ptr(width: Width),
                Dup => op_dup(depth: Depth),
                PushArray => op_push_array(),
                LoadArray => op_load_array(width: Width),
                StoreArray => op_store_array(width: Width),
                // Arithmetic
                IAdd => op_binary[|a, b| Word::from_i64(a.as_i64().wrapping_add(b.as_i64()))],
                FAdd => op_binary[|a, b| Word::from_f64(a.as_f64() + b.as_f64())],
                UAdd => op_binary[|a, b| Word::from_u64(a.as_u64().wrapping_add(b.as_u64()))],
                ISub => op_binary[|a, b| Word::from_i64(a.as_i64().wrapping_sub(b.as_i64()))],
                FSub => op_binary[|a, b| Word::from_f64(a.as_f64() - b.as_f64())],
                USub => op_binary[|a, b| Word::from_u64(a.as_u64().wrapping_sub(b.as_u64()))],
                IMul => op_binary[|a, b| Word::from_i64(a.as_i64().wrapping_mul(b.as_i64()))],
                FMul => op_binary[|a, b| Word::from_f64(a.as_f64() * b.as_f64())],
                UMul => op_binary[|a, b| Word::from_u64(a.as_u64().wrapping_mul(b.as_u64()))],
                IDiv => op_division[int_zero, |a, b| Word::from_i64(a.as_i64().wrapping_div(b.as_i64()))],
                FDiv => op_division[float_zero, |a, b| Word::from_f64(a.as_f64() / b.as_f64())],
                UDiv => op_division[int_zero, |a, b| Word::from_u64(a.as_u64() / b.as_u64())],
                IMod => op_division[int_zero, |a, b| Word::from_i64(a.as_i64().wrapping_rem(b.as_i64()))],
                FMod => op_division[float_zero, |a, b| Word::from_f64(ieee_remainder(a.as_f64(), b.as_f64()))],
                UMod => op_division[int_zero, |a, b| Word::from_u64(a.as_u64() % b.as_u64())],
                // Comparison
                ILess => op_binary[|a, b| Word::from_bool(a.as_i64() < b.as_i64())],
                FLess => op_binary[|a, b| Word::from_bool(a.as_f64() < b.as_f64())],
                ULess => op_binary[|a, b| Word::from_bool(a.as_u64() < b.as_u64())],
                ILessEqual => op_binary[|a, b| Word::from_bool(a.as_i64() <= b.as_i64())],
                FLessEqual => op_binary[|a, b| Word::from_bool(a.as_f64() <= b.as_f64())],
                ULessEqual => op_binary[|a, b| Word::from_bool(a.as_u64() <= b.as_u64())],
                IGreater => op_binary[|a, b| Word::from_bool(a.as_i64() > b.as_i64())],
                FGreater => op_binary[|a, b| Word::from_bool(a.as_f64() > b.as_f64())],
                UGreater => op_binary[|a, b| Word::from_bool(a.as_u64() > b.as_u64())],
                IGreaterEquals => op_binary[|a, b| Word::from_bool(a.as_i64() >= b.as_i64())],
                FGreaterEquals => op_binary[|a, b| Word::from_bool(a.as_f64() >= b.as_f64())],
                UGreaterEquals => op_binary[|a, b| Word::from_bool(a.as_u64() >= b.as_u64())],
                Eq => op_binary[|a, b| Word::from_bool(a == b)],
                Neq => op_binary[|a, b| Word::from_bool(a != b)],
                // Bitwise
                And => op_binary[|a, b| Word::from_u64(a.as_u64() & b.as_u64())],
                Or => op_binary[|a, b| Word::from_u64(a.as_u64() | b.as_u64())],
                Xor => op_binary[|a, b| Word::from_u64(a.as_u64() ^ b.as_u64())],
                LShift => op_binary[|a, b| Word::from_u64(a.as_u64() << (b.as_u64() & 63))],
                RShift => op_binary[|a, b| Word::from_u64(a.as_u64() >> (b.as_u64() & 63))],
                // Unary
                INeg => op_unary[|a| Word::from_i64(a.as_i64().wrapping_neg())],
                FNeg => op_unary[|a| Word::from_f64(-a.as_f64())],
                UNeg => op_unary[|a| Word::from_u64(a.as_u64().wrapping_neg())],
                Not => op_unary[|a| Word::from_bool(a.is_zero())],
                Ones => op_unary[|a| Word::from_u64(!a.as_u64())],
                // Control flow
                Int => op_int(code: Code),
                Jmp => op_jmp(target: Target),
                JmpZero => op_jmp_zero(target: Target),
                JmpNotZero => op_jmp_not_zero(target: Target),
                Call => op_call(target: Target),
                VCall => op_vcall(),
                Ret => op_ret(),
                // Casts
                Itu => op_unary[|a| a],
                Itf => op_unary[|a| Word::from_f64(a.as_i64() as f64)],
                Fti => op_unary[|a| Word::from_i64(a.as_f64() as i64)],
                Ftu => op_unary[|a| Word::from_u64(a.as_f64() as u64)],
                Uti => op_unary[|a| a],
                Utf => op_unary[|a| Word::from_f64(a.as_u64() as f64)],
                // Module memory
                LoadMemory => op_load_memory(offset: Offset),
            }
        }
    }

    // =========================
    // Module table
    // =========================

    /// Maps the module's memory segment into the guest heap.
    fn install(&mut self, mut module: Module) -> Module {
        if let MemorySegment::Detached(bytes) = std::mem::take(&mut module.memory) {
            let len = bytes.len();
            let base = if len == 0 {
                0
            } else {
                self.heap.map_segment(bytes)
            };
            module.memory = MemorySegment::Mapped { base, len };
        }
        module
    }

    /// Unmaps the module's memory and hands it back to the linker.
    fn release(&mut self, module: Module) -> Result<(), VmError> {
        if let MemorySegment::Mapped { base, .. } = module.memory {
            if base != 0 {
                self.heap.unmap_segment(base)?;
            }
        }
        self.linker.unload(module);
        Ok(())
    }

    /// Loaded module at `index`.
    pub fn module(&self, index: u64) -> Result<&Module, VmError> {
        usize::try_from(index)
            .ok()
            .and_then(|slot| self.modules.get(slot))
            .and_then(Option::as_ref)
            .ok_or(VmError::IllegalLibraryIndex { index })
    }

    fn active_module(&self) -> Result<&Module, VmError> {
        self.module(self.active as u64)
    }

    /// Links the module at `path` and returns its index.
    pub fn link_module(&mut self, path: &str) -> Result<u64, VmError> {
        if self.modules.len() >= self.config.module_capacity {
            return Err(VmError::LibraryOverflow);
        }
        let module = self.linker.load(path)?;
        let module = self.install(module);
        self.modules.push(Some(module));
        let index = self.modules.len() as u64 - 1;
        info!("module {path} is index {index}");
        Ok(index)
    }

    /// Unloads a dynamically linked module. The bootstrap module cannot be
    /// unloaded.
    pub fn unlink_module(&mut self, index: u64) -> Result<(), VmError> {
        let module = usize::try_from(index)
            .ok()
            .filter(|slot| *slot != 0)
            .and_then(|slot| self.modules.get_mut(slot))
            .and_then(Option::take)
            .ok_or(VmError::IllegalLibraryIndex { index })?;
        self.release(module)
    }

    /// Address of symbol `name` exported by dynamically linked module `index`.
    pub fn resolve_symbol(&self, index: u64, name: &[u8]) -> Result<u64, VmError> {
        if index == 0 {
            return Err(VmError::IllegalLibraryIndex { index });
        }
        DynamicLinker::resolve_symbol(self.module(index)?, name)
    }

    /// Number of module slots in use, unloaded ones included.
    pub fn module_slots(&self) -> usize {
        self.modules.len()
    }

    // =========================
    // State access
    // =========================

    pub fn pc(&self) -> u64 {
        self.pc
    }

    /// Moves the program counter, e.g. to resume after inspecting a halt.
    pub fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
    }

    /// Index of the module the program counter points into.
    pub fn active_module_index(&self) -> usize {
        self.active
    }

    /// Instructions executed so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn stack(&self) -> &Stack<Word> {
        &self.stack
    }

    pub fn stack_mut(&mut self) -> &mut Stack<Word> {
        &mut self.stack
    }

    pub fn pools(&self) -> &Stack<u64> {
        &self.pools
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn io_mut(&mut self) -> &mut HostIo {
        &mut self.io
    }

    /// Guest heap and host file table, borrowed together for transfers
    /// between them.
    pub fn host_parts(&mut self) -> (&mut Heap, &mut HostIo) {
        (&mut self.heap, &mut self.io)
    }

    // =========================
    // Stack and pool memory
    // =========================

    fn op_nop(&mut self) -> Result<(), VmError> {
        Ok(())
    }

    fn op_push(&mut self, value: Word) -> Result<(), VmError> {
        self.stack.push(value)
    }

    fn op_pop(&mut self) -> Result<(), VmError> {
        self.stack.pop().map(|_| ())
    }

    /// Address `offset` bytes into the current pool allocation.
    fn pool_address(&self, offset: u64) -> Result<u64, VmError> {
        Heap::offset(self.pools.top()?, offset)
    }

    fn op_load(&mut self, offset: u64) -> Result<(), VmError> {
        let width = self.stack.top()?.as_u64();
        let address = self.pool_address(offset)?;
        let value = self.heap.read(address, width)?;
        self.stack.set(0, Word::from_u64(value))
    }

    fn op_store(&mut self, offset: u64) -> Result<(), VmError> {
        self.stack.require(2)?;
        let width = self.stack.peek(0)?.as_u64();
        let value = self.stack.peek(1)?.as_u64();
        let address = self.pool_address(offset)?;
        self.heap.write(address, value, width)?;
        self.stack.drop_n(2)
    }

    fn op_malloc_pool(&mut self, key: u64) -> Result<(), VmError> {
        self.pools.reserve(1)?;
        let size = self.active_module()?.pool.get(key);
        let address = self.heap.allocate(u64::from(size));
        self.pools.push(address)
    }

    fn op_free_pool(&mut self) -> Result<(), VmError> {
        let address = self.pools.top()?;
        self.heap.release(address)?;
        self.pools.pop().map(|_| ())
    }

    fn op_push_ptr(&mut self, offset: u64) -> Result<(), VmError> {
        let address = self.pool_address(offset)?;
        self.stack.push(Word::from_address(address))
    }

    fn op_load_ptr(&mut self, width: u64) -> Result<(), VmError> {
        let address = self.stack.top()?.as_address();
        let value = self.heap.read(address, width)?;
        self.stack.set(0, Word::from_u64(value))
    }

    fn op_store_ptr(&mut self, width: u64) -> Result<(), VmError> {
        self.stack.require(2)?;
        let value = self.stack.peek(0)?.as_u64();
        let address = self.stack.peek(1)?.as_address();
        self.heap.write(address, value, width)?;
        self.stack.drop_n(2)
    }

    fn op_dup(&mut self, depth: u64) -> Result<(), VmError> {
        let depth = usize::try_from(depth).map_err(|_| VmError::StackUnderflow)?;
        let value = self.stack.peek(depth)?;
        self.stack.push(value)
    }

    fn op_push_array(&mut self) -> Result<(), VmError> {
        let size = self.stack.top()?.as_u64();
        let address = self.heap.allocate(size);
        self.stack.set(0, Word::from_address(address))
    }

    fn op_load_array(&mut self, width: u64) -> Result<(), VmError> {
        self.stack.require(2)?;
        let index = self.stack.peek(0)?.as_u64();
        let base = self.stack.peek(1)?.as_address();
        let value = self.heap.read(Heap::offset(base, index)?, width)?;
        self.stack.set(1, Word::from_u64(value))?;
        self.stack.drop_n(1)
    }

    fn op_store_array(&mut self, width: u64) -> Result<(), VmError> {
        self.stack.require(3)?;
        let value = self.stack.peek(0)?.as_u64();
        let index = self.stack.peek(1)?.as_u64();
        let base = self.stack.peek(2)?.as_address();
        self.heap.write(Heap::offset(base, index)?, value, width)?;
        self.stack.drop_n(3)
    }

    // =========================
    // Arithmetic
    // =========================

    /// `[a, b] -> [f(a, b)]`
    fn op_binary(&mut self, f: fn(Word, Word) -> Word) -> Result<(), VmError> {
        self.stack.require(2)?;
        let b = self.stack.peek(0)?;
        let a = self.stack.peek(1)?;
        self.stack.set(1, f(a, b))?;
        self.stack.drop_n(1)
    }

    /// Like [`op_binary`](Self::op_binary), refusing a zero divisor.
    fn op_division(
        &mut self,
        is_zero: fn(Word) -> bool,
        f: fn(Word, Word) -> Word,
    ) -> Result<(), VmError> {
        self.stack.require(2)?;
        if is_zero(self.stack.peek(0)?) {
            return Err(VmError::DivisionByZero);
        }
        self.op_binary(f)
    }

    /// `[a] -> [f(a)]`
    fn op_unary(&mut self, f: fn(Word) -> Word) -> Result<(), VmError> {
        let a = self.stack.top()?;
        self.stack.set(0, f(a))
    }

    // =========================
    // Control flow
    // =========================

    fn op_int(&mut self, code: u64) -> Result<(), VmError> {
        let handler = self.interrupts.get(code)?;
        handler(self)
    }

    /// Validates a jump target inside the active module.
    fn branch_target(&self, target: u64) -> Result<u64, VmError> {
        if self.active_module()?.contains(target) {
            Ok(target)
        } else {
            Err(VmError::IllegalAccess)
        }
    }

    fn op_jmp(&mut self, target: u64) -> Result<(), VmError> {
        self.pc = self.branch_target(target)?;
        Ok(())
    }

    fn op_jmp_zero(&mut self, target: u64) -> Result<(), VmError> {
        self.op_jmp_if(false, target)
    }

    fn op_jmp_not_zero(&mut self, target: u64) -> Result<(), VmError> {
        self.op_jmp_if(true, target)
    }

    /// Pops the condition and jumps if it is non-zero (`when_set`) or zero.
    fn op_jmp_if(&mut self, when_set: bool, target: u64) -> Result<(), VmError> {
        let taken = self.stack.top()?.is_zero() != when_set;
        let next = if taken { self.branch_target(target)? } else { self.pc };
        self.stack.drop_n(1)?;
        self.pc = next;
        Ok(())
    }

    /// Resolves a `[module, address]` frame into a module slot and a valid
    /// instruction index inside it.
    fn frame_target(&self, module: Word, address: Word) -> Result<(usize, u64), VmError> {
        let index = module.as_u64();
        let target = self.module(index)?;
        if !target.contains(address.as_u64()) {
            return Err(VmError::IllegalAccess);
        }
        Ok((index as usize, address.as_u64()))
    }

    /// Word pair a frame is made of: the caller's module and return address.
    fn return_frame(&self) -> (Word, Word) {
        (Word::from_u64(self.active as u64), Word::from_u64(self.pc))
    }

    fn op_call(&mut self, target: u64) -> Result<(), VmError> {
        self.stack.reserve(2)?;
        let target = self.branch_target(target)?;
        let (module, address) = self.return_frame();
        self.stack.push(module)?;
        self.stack.push(address)?;
        self.pc = target;
        Ok(())
    }

    fn op_vcall(&mut self) -> Result<(), VmError> {
        self.stack.require(2)?;
        let (module, target) =
            self.frame_target(self.stack.peek(1)?, self.stack.peek(0)?)?;
        let (caller, address) = self.return_frame();
        self.stack.set(1, caller)?;
        self.stack.set(0, address)?;
        self.active = module;
        self.pc = target;
        Ok(())
    }

    fn op_ret(&mut self) -> Result<(), VmError> {
        self.stack.require(2)?;
        let (module, address) =
            self.frame_target(self.stack.peek(1)?, self.stack.peek(0)?)?;
        self.stack.drop_n(2)?;
        self.active = module;
        self.pc = address;
        Ok(())
    }

    // =========================
    // Module memory
    // =========================

    fn op_load_memory(&mut self, offset: u64) -> Result<(), VmError> {
        let memory = &self.active_module()?.memory;
        if offset >= memory.len() as u64 {
            return Err(VmError::IllegalAccess);
        }
        let base = memory.base().ok_or(VmError::IllegalAccess)?;
        self.stack.push(Word::from_address(base + offset))
    }
}

impl Drop for Machine<'_> {
    fn drop(&mut self) {
        for module in self.modules.drain(..).skip(1).flatten() {
            self.linker.unload(module);
        }
    }
}
