//! LIR (Low-level Intermediate Representation). In this form, loops and
//! conditionals are simplified to blocks and branches, expression trees are
//! flattened into instructions over typed virtual registers, and all tensor
//! accesses are loads and stores against byte-addressed buffers.
//!
//! The LIR is the code-emission target of the backend and the input of the
//! execution engine in [`super::vm`].

use crate::index::{simple_index, IndexVec};
use crate::ir::{BinaryOperator, UnaryOperator};

simple_index! {
    /// Identifies an LIR block within one function
    pub struct BlockId;
}

simple_index! {
    /// Identifies a virtual LIR register which holds a temporary value
    pub struct RegisterId;
}

simple_index! {
    /// Identifies a module-level global slot
    pub struct GlobalId;
}

impl BlockId {
    pub const ENTRY: Self = Self(0);
}

/// The component kind of one buffer element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Int,
    F32,
    F64,
    Bool,
}

impl Component {
    pub fn bytes(self) -> usize {
        match self {
            Component::Int => 4,
            Component::F32 => 4,
            Component::F64 => 8,
            Component::Bool => 1,
        }
    }
}

/// The type of a virtual register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Int,
    Float,
    Bool,
    /// A pointer into a buffer of the given component kind.
    Ptr(Component),
    /// An aggregate of runtime values (the in-memory form of a set).
    Fields,
}

/// A temporary virtual register of some type
#[derive(Debug, Clone, PartialEq)]
pub struct Register {
    pub id: RegisterId,
    pub ty: Type,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Immediate {
    Int(i32),
    Float(f64),
    Bool(bool),
    /// The null pointer, the initial value of every global slot.
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    Immediate(Immediate),
    Register(RegisterId),
}

impl Operand {
    pub fn int(value: i64) -> Self {
        Operand::Immediate(Immediate::Int(value as i32))
    }
}

/// Who a call instruction targets: another function in this module, or a
/// named routine of the runtime library.
#[derive(Debug, Clone, PartialEq)]
pub enum Callee {
    Function(String),
    Runtime(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Move {
        destination: RegisterId,
        source: Operand,
    },
    Unary {
        operator: UnaryOperator,
        destination: RegisterId,
        operand: Operand,
    },
    Binary {
        operator: BinaryOperator,
        destination: RegisterId,
        lhs: Operand,
        rhs: Operand,
    },
    /// Allocates `len` components in the current frame. The buffer lives
    /// until the function returns.
    Alloca {
        destination: RegisterId,
        component: Component,
        len: Operand,
    },
    Load {
        destination: RegisterId,
        component: Component,
        ptr: Operand,
        index: Operand,
    },
    Store {
        component: Component,
        ptr: Operand,
        index: Operand,
        value: Operand,
    },
    /// Reads one slot out of an aggregate value.
    ExtractField {
        destination: RegisterId,
        record: Operand,
        slot: usize,
    },
    GlobalLoad {
        destination: RegisterId,
        global: GlobalId,
    },
    GlobalStore {
        global: GlobalId,
        value: Operand,
    },
    /// Fills `size` bytes starting at `ptr` with `value`.
    MemSet {
        ptr: Operand,
        value: u8,
        size: Operand,
    },
    /// Copies `size` bytes between non-overlapping buffers.
    MemCpy {
        destination: Operand,
        source: Operand,
        size: Operand,
    },
    Call {
        callee: Callee,
        arguments: Vec<Operand>,
        destination: Option<RegisterId>,
    },
    /// A formatted write to the program's output stream. The format string
    /// uses C conversion syntax (`%d`, `%g`).
    Printf {
        format: String,
        arguments: Vec<Operand>,
    },
    Branch {
        condition: Operand,
        positive: BlockId,
        negative: BlockId,
    },
    Jump {
        destination: BlockId,
    },
    Return,
}

#[derive(Debug)]
pub struct Block {
    pub id: BlockId,
    pub instructions: Vec<Instruction>,
}

/// A module-level slot holding a pointer to an allocated tensor buffer.
#[derive(Debug, Clone)]
pub struct Global {
    pub name: String,
    pub component: Component,
}

#[derive(Debug)]
pub struct FunctionDefinition {
    pub name: String,
    /// Formal parameters in positional order (arguments then results).
    pub params: Vec<RegisterId>,
    pub registers: IndexVec<RegisterId, Register>,
    pub blocks: IndexVec<BlockId, Block>,
    /// Only the root function of a compilation is visible outside the
    /// module.
    pub exported: bool,
}

#[derive(Debug, Default)]
pub struct Module {
    pub name: String,
    pub functions: Vec<FunctionDefinition>,
    pub globals: IndexVec<GlobalId, Global>,
    /// Whether the allocator hooks were declared for this module.
    pub uses_allocator: bool,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn function(&self, name: &str) -> Option<&FunctionDefinition> {
        self.functions.iter().find(|f| f.name == name)
    }
}

/// Builds one [`FunctionDefinition`], maintaining an insert point the way a
/// low-level IR builder does.
#[derive(Debug)]
pub struct FunctionBuilder {
    name: String,
    exported: bool,
    params: Vec<RegisterId>,
    registers: IndexVec<RegisterId, Register>,
    blocks: IndexVec<BlockId, Block>,
    current: BlockId,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>, exported: bool) -> Self {
        let mut blocks = IndexVec::new();
        let entry = blocks.push(Block {
            id: BlockId::ENTRY,
            instructions: Vec::new(),
        });
        Self {
            name: name.into(),
            exported,
            params: Vec::new(),
            registers: IndexVec::new(),
            blocks,
            current: entry,
        }
    }

    pub fn create_register(&mut self, ty: Type) -> RegisterId {
        let id = self.registers.next_index();
        self.registers.push(Register { id, ty })
    }

    /// Creates a register and appends it to the formal parameter list.
    pub fn add_param(&mut self, ty: Type) -> RegisterId {
        let id = self.create_register(ty);
        self.params.push(id);
        id
    }

    pub fn create_block(&mut self) -> BlockId {
        let id = self.blocks.next_index();
        self.blocks.push(Block {
            id,
            instructions: Vec::new(),
        })
    }

    pub fn insert_point(&self) -> BlockId {
        self.current
    }

    pub fn set_insert_point(&mut self, block: BlockId) {
        self.current = block;
    }

    pub fn push(&mut self, instruction: Instruction) {
        self.blocks[self.current].instructions.push(instruction);
    }

    pub fn register_type(&self, id: RegisterId) -> Type {
        self.registers[id].ty
    }

    /// The pointed-to component kind of a pointer-typed operand, if it is
    /// one. Immediates are never pointers.
    pub fn pointer_component(&self, operand: &Operand) -> Option<Component> {
        match operand {
            Operand::Register(id) => match self.register_type(*id) {
                Type::Ptr(component) => Some(component),
                _ => None,
            },
            Operand::Immediate(_) => None,
        }
    }

    pub fn finish(self) -> FunctionDefinition {
        FunctionDefinition {
            name: self.name,
            params: self.params,
            registers: self.registers,
            blocks: self.blocks,
            exported: self.exported,
        }
    }
}

impl core::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Immediate(Immediate::Int(v)) => write!(f, "{v}"),
            Operand::Immediate(Immediate::Float(v)) => write!(f, "{v}"),
            Operand::Immediate(Immediate::Bool(v)) => write!(f, "{v}"),
            Operand::Immediate(Immediate::Null) => write!(f, "null"),
            Operand::Register(id) => write!(f, "%{}", crate::index::Index::index(*id)),
        }
    }
}

impl core::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use crate::index::Index;
        match self {
            Instruction::Move {
                destination,
                source,
            } => write!(f, "%{} = {source}", destination.index()),
            Instruction::Unary {
                operator,
                destination,
                operand,
            } => write!(f, "%{} = {operator} {operand}", destination.index()),
            Instruction::Binary {
                operator,
                destination,
                lhs,
                rhs,
            } => write!(f, "%{} = {operator} {lhs}, {rhs}", destination.index()),
            Instruction::Alloca {
                destination,
                component,
                len,
            } => write!(
                f,
                "%{} = alloca {component:?} x {len}",
                destination.index()
            ),
            Instruction::Load {
                destination,
                component,
                ptr,
                index,
            } => write!(
                f,
                "%{} = load {component:?} {ptr}[{index}]",
                destination.index()
            ),
            Instruction::Store {
                component,
                ptr,
                index,
                value,
            } => write!(f, "store {component:?} {ptr}[{index}], {value}"),
            Instruction::ExtractField {
                destination,
                record,
                slot,
            } => write!(f, "%{} = field {record}.{slot}", destination.index()),
            Instruction::GlobalLoad {
                destination,
                global,
            } => write!(f, "%{} = global.load @{}", destination.index(), global.index()),
            Instruction::GlobalStore { global, value } => {
                write!(f, "global.store @{}, {value}", global.index())
            }
            Instruction::MemSet { ptr, value, size } => {
                write!(f, "memset {ptr}, {value}, {size}")
            }
            Instruction::MemCpy {
                destination,
                source,
                size,
            } => write!(f, "memcpy {destination}, {source}, {size}"),
            Instruction::Call {
                callee,
                arguments,
                destination,
            } => {
                if let Some(destination) = destination {
                    write!(f, "%{} = ", destination.index())?;
                }
                match callee {
                    Callee::Function(name) => write!(f, "call {name}(")?,
                    Callee::Runtime(name) => write!(f, "call.rt {name}(")?,
                }
                for (i, a) in arguments.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
            Instruction::Printf { format, arguments } => {
                write!(f, "printf {format:?}")?;
                for a in arguments {
                    write!(f, ", {a}")?;
                }
                Ok(())
            }
            Instruction::Branch {
                condition,
                positive,
                negative,
            } => write!(
                f,
                "br {condition}, bb{}, bb{}",
                positive.index(),
                negative.index()
            ),
            Instruction::Jump { destination } => write!(f, "jmp bb{}", destination.index()),
            Instruction::Return => write!(f, "ret"),
        }
    }
}

impl core::fmt::Display for FunctionDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use crate::index::Index;
        write!(f, "fn {}(", self.name)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "%{}: {:?}", p.index(), self.registers[*p].ty)?;
        }
        writeln!(f, "){}", if self.exported { " export" } else { "" })?;
        for block in self.blocks.iter() {
            writeln!(f, "bb{}:", block.id.index())?;
            for instruction in &block.instructions {
                writeln!(f, "    {instruction}")?;
            }
        }
        Ok(())
    }
}

impl core::fmt::Display for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use crate::index::Index;
        writeln!(f, "module {}", self.name)?;
        for (id, global) in self.globals.enumerate() {
            writeln!(
                f,
                "global @{} {} : {:?}",
                id.index(),
                global.name,
                global.component
            )?;
        }
        for function in &self.functions {
            writeln!(f)?;
            write!(f, "{function}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_tracks_insert_point() {
        let mut b = FunctionBuilder::new("f", true);
        let r = b.create_register(Type::Int);
        b.push(Instruction::Move {
            destination: r,
            source: Operand::int(1),
        });
        let other = b.create_block();
        b.set_insert_point(other);
        b.push(Instruction::Return);

        let def = b.finish();
        assert_eq!(def.blocks.len(), 2);
        assert_eq!(def.blocks[BlockId::ENTRY].instructions.len(), 1);
        assert_eq!(def.blocks[other].instructions, vec![Instruction::Return]);
    }

    #[test]
    fn params_are_registers_in_order() {
        let mut b = FunctionBuilder::new("f", false);
        let a = b.add_param(Type::Float);
        let out = b.add_param(Type::Ptr(Component::F64));
        assert_eq!(b.register_type(a), Type::Float);
        assert_eq!(
            b.pointer_component(&Operand::Register(out)),
            Some(Component::F64)
        );
        let def = b.finish();
        assert_eq!(def.params, vec![a, out]);
    }

    #[test]
    fn display_renders_blocks() {
        let mut b = FunctionBuilder::new("main", true);
        b.push(Instruction::Return);
        let def = b.finish();
        let text = def.to_string();
        assert!(text.contains("fn main() export"));
        assert!(text.contains("bb0:"));
        assert!(text.contains("ret"));
    }
}
