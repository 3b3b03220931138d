//! The execution engine: a small register machine that runs LIR modules.
//!
//! Memory is a pool of byte buffers addressed by [`Ptr`] values; loads and
//! stores are element-indexed against a component kind, so a buffer's byte
//! size is always `len * component.bytes()` — the same quantity the emitted
//! length computations produce. Set values travel as [`Value::Fields`]
//! records whose slot layout the backend fixes (cardinality first).

use std::cell::RefCell;
use std::rc::Rc;

use crate::backend::lir::{
    self, BlockId, Callee, Component, Immediate, Instruction, Operand, RegisterId,
};
use crate::backend::runtime;
use crate::diagnostics::internal_error;
use crate::index::Index;
use crate::ir::{BinaryOperator, UnaryOperator};

/// A pointer into VM memory: a buffer id plus a byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ptr {
    pub buffer: usize,
    pub offset: usize,
}

/// A runtime value held in a register, a global slot, or a record field.
#[derive(Debug, Clone)]
pub enum Value {
    Int(i32),
    Float(f64),
    Bool(bool),
    Ptr(Ptr),
    /// An aggregate of values (the in-memory form of a set).
    Fields(Rc<Vec<Value>>),
    Undef,
}

impl Value {
    pub fn as_int(&self) -> i32 {
        match self {
            Value::Int(v) => *v,
            other => internal_error!("expected int value, got {other:?}"),
        }
    }

    pub fn as_float(&self) -> f64 {
        match self {
            Value::Float(v) => *v,
            other => internal_error!("expected float value, got {other:?}"),
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            Value::Bool(v) => *v,
            other => internal_error!("expected bool value, got {other:?}"),
        }
    }

    pub fn as_ptr(&self) -> Ptr {
        match self {
            Value::Ptr(p) => *p,
            other => internal_error!("expected pointer value, got {other:?}"),
        }
    }

    pub fn as_fields(&self) -> &Rc<Vec<Value>> {
        match self {
            Value::Fields(f) => f,
            other => internal_error!("expected record value, got {other:?}"),
        }
    }
}

#[derive(Debug)]
struct Buffer {
    bytes: Vec<u8>,
    freed: bool,
}

/// The byte-buffer pool backing all tensor storage.
#[derive(Debug, Default)]
pub struct Memory {
    buffers: Vec<Buffer>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, size: usize) -> Ptr {
        let buffer = self.buffers.len();
        self.buffers.push(Buffer {
            bytes: vec![0; size],
            freed: false,
        });
        Ptr { buffer, offset: 0 }
    }

    pub fn free(&mut self, ptr: Ptr) {
        let buffer = &mut self.buffers[ptr.buffer];
        if buffer.freed {
            internal_error!("double free of buffer {}", ptr.buffer);
        }
        buffer.freed = true;
        buffer.bytes = Vec::new();
    }

    fn buffer(&self, ptr: Ptr) -> &Buffer {
        let buffer = &self.buffers[ptr.buffer];
        if buffer.freed {
            internal_error!("use of freed buffer {}", ptr.buffer);
        }
        buffer
    }

    fn buffer_mut(&mut self, ptr: Ptr) -> &mut Buffer {
        let buffer = &mut self.buffers[ptr.buffer];
        if buffer.freed {
            internal_error!("use of freed buffer {}", ptr.buffer);
        }
        buffer
    }

    pub fn read(&self, component: Component, ptr: Ptr, index: i64) -> Value {
        let size = component.bytes();
        let at = ptr.offset + index as usize * size;
        let bytes = &self.buffer(ptr).bytes[at..at + size];
        match component {
            Component::Int => Value::Int(i32::from_le_bytes(bytes.try_into().unwrap())),
            Component::F32 => Value::Float(f32::from_le_bytes(bytes.try_into().unwrap()) as f64),
            Component::F64 => Value::Float(f64::from_le_bytes(bytes.try_into().unwrap())),
            Component::Bool => Value::Bool(bytes[0] != 0),
        }
    }

    pub fn write(&mut self, component: Component, ptr: Ptr, index: i64, value: &Value) {
        let size = component.bytes();
        let at = ptr.offset + index as usize * size;
        let bytes = &mut self.buffer_mut(ptr).bytes[at..at + size];
        match component {
            Component::Int => bytes.copy_from_slice(&value.as_int().to_le_bytes()),
            Component::F32 => bytes.copy_from_slice(&(value.as_float() as f32).to_le_bytes()),
            Component::F64 => bytes.copy_from_slice(&value.as_float().to_le_bytes()),
            Component::Bool => bytes[0] = value.as_bool() as u8,
        }
    }

    pub fn memset(&mut self, ptr: Ptr, value: u8, size: usize) {
        let buffer = self.buffer_mut(ptr);
        buffer.bytes[ptr.offset..ptr.offset + size].fill(value);
    }

    pub fn memcpy(&mut self, destination: Ptr, source: Ptr, size: usize) {
        let bytes =
            self.buffer(source).bytes[source.offset..source.offset + size].to_vec();
        self.buffer_mut(destination).bytes[destination.offset..destination.offset + size]
            .copy_from_slice(&bytes);
    }
}

#[derive(Debug)]
enum Output {
    Stdout,
    Capture(Rc<RefCell<String>>),
}

/// The mutable state a compiled module executes against: memory, global
/// slots and the output stream. One context is shared by a compiled
/// function, its init/deinit companions and its harness.
#[derive(Debug)]
pub struct ExecutionContext {
    pub memory: Memory,
    pub globals: Vec<Value>,
    output: Output,
}

impl ExecutionContext {
    pub fn new(global_count: usize) -> Self {
        Self {
            memory: Memory::new(),
            globals: vec![Value::Undef; global_count],
            output: Output::Stdout,
        }
    }

    /// Redirects program output into a shared string, for tests and the
    /// driver's capture mode.
    pub fn capture_output(&mut self) -> Rc<RefCell<String>> {
        let sink = Rc::new(RefCell::new(String::new()));
        self.output = Output::Capture(sink.clone());
        sink
    }

    pub fn write_output(&mut self, text: &str) {
        match &self.output {
            Output::Stdout => print!("{text}"),
            Output::Capture(sink) => sink.borrow_mut().push_str(text),
        }
    }
}

/// Runs the named function of a module with the given positional arguments.
pub fn execute(module: &lir::Module, name: &str, args: &[Value], ctx: &mut ExecutionContext) {
    let function = module
        .function(name)
        .unwrap_or_else(|| internal_error!("function {name} not found in module"));
    exec_function(module, function, args, ctx);
}

fn exec_function(
    module: &lir::Module,
    function: &lir::FunctionDefinition,
    args: &[Value],
    ctx: &mut ExecutionContext,
) {
    if args.len() != function.params.len() {
        internal_error!(
            "function {} called with {} values but takes {}",
            function.name,
            args.len(),
            function.params.len()
        );
    }

    let mut registers = vec![Value::Undef; function.registers.len()];
    for (param, arg) in function.params.iter().zip(args) {
        registers[param.index()] = arg.clone();
    }

    // Frame allocations are released when the function returns.
    let mut frame_allocs: Vec<Ptr> = Vec::new();

    let mut block = BlockId::ENTRY;
    let mut pc = 0usize;

    loop {
        let instruction = &function.blocks[block].instructions[pc];
        pc += 1;

        match instruction {
            Instruction::Move {
                destination,
                source,
            } => {
                let value = eval(source, &registers);
                registers[destination.index()] = value;
            }
            Instruction::Unary {
                operator,
                destination,
                operand,
            } => {
                let operand = eval(operand, &registers);
                registers[destination.index()] = eval_unary(*operator, &operand);
            }
            Instruction::Binary {
                operator,
                destination,
                lhs,
                rhs,
            } => {
                let lhs = eval(lhs, &registers);
                let rhs = eval(rhs, &registers);
                registers[destination.index()] = eval_binary(*operator, &lhs, &rhs);
            }
            Instruction::Alloca {
                destination,
                component,
                len,
            } => {
                let len = eval(len, &registers).as_int();
                let ptr = ctx.memory.alloc(len as usize * component.bytes());
                frame_allocs.push(ptr);
                registers[destination.index()] = Value::Ptr(ptr);
            }
            Instruction::Load {
                destination,
                component,
                ptr,
                index,
            } => {
                let ptr = eval(ptr, &registers).as_ptr();
                let index = eval(index, &registers).as_int();
                registers[destination.index()] = ctx.memory.read(*component, ptr, index as i64);
            }
            Instruction::Store {
                component,
                ptr,
                index,
                value,
            } => {
                let ptr = eval(ptr, &registers).as_ptr();
                let index = eval(index, &registers).as_int();
                let value = eval(value, &registers);
                ctx.memory.write(*component, ptr, index as i64, &value);
            }
            Instruction::ExtractField {
                destination,
                record,
                slot,
            } => {
                let record = eval(record, &registers);
                registers[destination.index()] = record.as_fields()[*slot].clone();
            }
            Instruction::GlobalLoad {
                destination,
                global,
            } => {
                registers[destination.index()] = ctx.globals[global.index()].clone();
            }
            Instruction::GlobalStore { global, value } => {
                ctx.globals[global.index()] = eval(value, &registers);
            }
            Instruction::MemSet { ptr, value, size } => {
                let ptr = eval(ptr, &registers).as_ptr();
                let size = eval(size, &registers).as_int();
                ctx.memory.memset(ptr, *value, size as usize);
            }
            Instruction::MemCpy {
                destination,
                source,
                size,
            } => {
                let destination = eval(destination, &registers).as_ptr();
                let source = eval(source, &registers).as_ptr();
                let size = eval(size, &registers).as_int();
                ctx.memory.memcpy(destination, source, size as usize);
            }
            Instruction::Call {
                callee,
                arguments,
                destination,
            } => {
                let values: Vec<Value> = arguments.iter().map(|a| eval(a, &registers)).collect();
                match callee {
                    Callee::Function(name) => {
                        let callee = module.function(name).unwrap_or_else(|| {
                            internal_error!("function {name} not found in module")
                        });
                        exec_function(module, callee, &values, ctx);
                        if destination.is_some() {
                            internal_error!("internal calls return through result pointers");
                        }
                    }
                    Callee::Runtime(name) => {
                        let result = runtime::call(name, &values, ctx);
                        if let Some(destination) = destination {
                            registers[destination.index()] = result.unwrap_or_else(|| {
                                internal_error!("runtime routine {name} returned no value")
                            });
                        }
                    }
                }
            }
            Instruction::Printf { format, arguments } => {
                let values: Vec<Value> = arguments.iter().map(|a| eval(a, &registers)).collect();
                let text = runtime::format_printf(format, &values);
                ctx.write_output(&text);
            }
            Instruction::Branch {
                condition,
                positive,
                negative,
            } => {
                block = if eval(condition, &registers).as_bool() {
                    *positive
                } else {
                    *negative
                };
                pc = 0;
            }
            Instruction::Jump { destination } => {
                block = *destination;
                pc = 0;
            }
            Instruction::Return => break,
        }
    }

    for ptr in frame_allocs {
        ctx.memory.free(ptr);
    }
}

fn eval(operand: &Operand, registers: &[Value]) -> Value {
    match operand {
        Operand::Register(id) => registers[id.index()].clone(),
        Operand::Immediate(Immediate::Int(v)) => Value::Int(*v),
        Operand::Immediate(Immediate::Float(v)) => Value::Float(*v),
        Operand::Immediate(Immediate::Bool(v)) => Value::Bool(*v),
        Operand::Immediate(Immediate::Null) => Value::Undef,
    }
}

fn eval_unary(operator: UnaryOperator, operand: &Value) -> Value {
    match (operator, operand) {
        (UnaryOperator::Neg, Value::Int(v)) => Value::Int(-v),
        (UnaryOperator::Neg, Value::Float(v)) => Value::Float(-v),
        (UnaryOperator::Not, Value::Bool(v)) => Value::Bool(!v),
        (op, v) => internal_error!("cannot apply {op} to {v:?}"),
    }
}

fn eval_binary(operator: BinaryOperator, lhs: &Value, rhs: &Value) -> Value {
    use BinaryOperator::*;
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => match operator {
            Add => Value::Int(a + b),
            Sub => Value::Int(a - b),
            Mul => Value::Int(a * b),
            // Truncated semantics, like a native signed remainder.
            Rem => Value::Int(a % b),
            Eq => Value::Bool(a == b),
            Ne => Value::Bool(a != b),
            Gt => Value::Bool(a > b),
            Lt => Value::Bool(a < b),
            Ge => Value::Bool(a >= b),
            Le => Value::Bool(a <= b),
            Div => internal_error!("integer division must be lowered before emission"),
            And | Or | Xor => internal_error!("cannot apply {operator} to ints"),
        },
        (Value::Float(a), Value::Float(b)) => match operator {
            Add => Value::Float(a + b),
            Sub => Value::Float(a - b),
            Mul => Value::Float(a * b),
            Div => Value::Float(a / b),
            Eq => Value::Bool(a == b),
            Ne => Value::Bool(a != b),
            Gt => Value::Bool(a > b),
            Lt => Value::Bool(a < b),
            Ge => Value::Bool(a >= b),
            Le => Value::Bool(a <= b),
            Rem | And | Or | Xor => internal_error!("cannot apply {operator} to floats"),
        },
        (Value::Bool(a), Value::Bool(b)) => match operator {
            And => Value::Bool(*a && *b),
            Or => Value::Bool(*a || *b),
            Xor => Value::Bool(a != b),
            Eq => Value::Bool(a == b),
            Ne => Value::Bool(a != b),
            _ => internal_error!("cannot apply {operator} to bools"),
        },
        (a, b) => internal_error!("operand kinds of {operator} don't match: {a:?} vs {b:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::lir::{FunctionBuilder, Type};

    #[test]
    fn memory_round_trips_components() {
        let mut memory = Memory::new();
        let ptr = memory.alloc(3 * Component::F64.bytes());
        memory.write(Component::F64, ptr, 1, &Value::Float(2.5));
        assert_eq!(memory.read(Component::F64, ptr, 1).as_float(), 2.5);
        assert_eq!(memory.read(Component::F64, ptr, 0).as_float(), 0.0);

        let ints = memory.alloc(2 * Component::Int.bytes());
        memory.write(Component::Int, ints, 0, &Value::Int(-7));
        assert_eq!(memory.read(Component::Int, ints, 0).as_int(), -7);
    }

    #[test]
    fn f32_storage_narrows() {
        let mut memory = Memory::new();
        let ptr = memory.alloc(Component::F32.bytes());
        memory.write(Component::F32, ptr, 0, &Value::Float(0.1));
        let read = memory.read(Component::F32, ptr, 0).as_float();
        assert_eq!(read, 0.1f32 as f64);
    }

    #[test]
    fn memset_and_memcpy_move_exact_byte_counts() {
        let mut memory = Memory::new();
        let a = memory.alloc(4 * 8);
        for i in 0..4 {
            memory.write(Component::F64, a, i, &Value::Float(i as f64 + 1.0));
        }
        let b = memory.alloc(4 * 8);
        memory.memcpy(b, a, 4 * 8);
        assert_eq!(memory.read(Component::F64, b, 3).as_float(), 4.0);

        memory.memset(a, 0, 4 * 8);
        assert_eq!(memory.read(Component::F64, a, 2).as_float(), 0.0);
        // The copy is unaffected by clearing the source afterwards.
        assert_eq!(memory.read(Component::F64, b, 2).as_float(), 3.0);
    }

    #[test]
    #[should_panic(expected = "use of freed buffer")]
    fn freed_buffers_trap_on_use()
    {
        let mut memory = Memory::new();
        let ptr = memory.alloc(8);
        memory.free(ptr);
        let _ = memory.read(Component::F64, ptr, 0);
    }

    /// Builds `out[0] = a + b` over float scalars and runs it.
    #[test]
    fn executes_a_scalar_add_function() {
        let mut b = FunctionBuilder::new("add", true);
        let x = b.add_param(Type::Float);
        let y = b.add_param(Type::Float);
        let out = b.add_param(Type::Ptr(Component::F64));
        let sum = b.create_register(Type::Float);
        b.push(Instruction::Binary {
            operator: BinaryOperator::Add,
            destination: sum,
            lhs: Operand::Register(x),
            rhs: Operand::Register(y),
        });
        b.push(Instruction::Store {
            component: Component::F64,
            ptr: Operand::Register(out),
            index: Operand::int(0),
            value: Operand::Register(sum),
        });
        b.push(Instruction::Return);

        let mut module = lir::Module::new("test");
        module.functions.push(b.finish());

        let mut ctx = ExecutionContext::new(0);
        let result = ctx.memory.alloc(8);
        execute(
            &module,
            "add",
            &[Value::Float(2.0), Value::Float(4.1), Value::Ptr(result)],
            &mut ctx,
        );
        assert_eq!(ctx.memory.read(Component::F64, result, 0).as_float(), 2.0 + 4.1);
    }

    /// A counted loop summing 0..5 into an int slot.
    #[test]
    fn executes_branches_and_loops() {
        let mut b = FunctionBuilder::new("sum", true);
        let out = b.add_param(Type::Ptr(Component::Int));
        let i = b.create_register(Type::Int);
        let acc = b.create_register(Type::Int);
        let body = b.create_block();
        let end = b.create_block();

        b.push(Instruction::Move {
            destination: i,
            source: Operand::int(0),
        });
        b.push(Instruction::Move {
            destination: acc,
            source: Operand::int(0),
        });
        b.push(Instruction::Jump { destination: body });

        b.set_insert_point(body);
        b.push(Instruction::Binary {
            operator: BinaryOperator::Add,
            destination: acc,
            lhs: Operand::Register(acc),
            rhs: Operand::Register(i),
        });
        b.push(Instruction::Binary {
            operator: BinaryOperator::Add,
            destination: i,
            lhs: Operand::Register(i),
            rhs: Operand::int(1),
        });
        let again = b.create_register(Type::Bool);
        b.push(Instruction::Binary {
            operator: BinaryOperator::Lt,
            destination: again,
            lhs: Operand::Register(i),
            rhs: Operand::int(5),
        });
        b.push(Instruction::Branch {
            condition: Operand::Register(again),
            positive: body,
            negative: end,
        });

        b.set_insert_point(end);
        b.push(Instruction::Store {
            component: Component::Int,
            ptr: Operand::Register(out),
            index: Operand::int(0),
            value: Operand::Register(acc),
        });
        b.push(Instruction::Return);

        let mut module = lir::Module::new("test");
        module.functions.push(b.finish());

        let mut ctx = ExecutionContext::new(0);
        let result = ctx.memory.alloc(4);
        execute(&module, "sum", &[Value::Ptr(result)], &mut ctx);
        assert_eq!(ctx.memory.read(Component::Int, result, 0).as_int(), 10);
    }
}
