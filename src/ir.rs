//! Representación intermedia.
//!
//! Un [`Module`] contiene variables globales y funciones. Cada función
//! es un grafo de control explícito: bloques básicos que terminan en
//! exactamente una instrucción terminal. Los valores locales se
//! definen una única vez, por lo cual cada [`Local`] identifica a la
//! instrucción que lo produce.

use std::{
    fmt::{self, Display},
    rc::Rc,
};

pub struct Module {
    pub globals: Vec<Rc<Global>>,
    pub functions: Vec<Function>,
}

/// Variable global con sus palabras iniciales.
#[derive(Debug, PartialEq, Eq)]
pub struct Global {
    pub name: String,
    pub init: Vec<i32>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Local(pub u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Const(i32),
    Global(Rc<Global>),

    /// Parámetro formal en su posición original.
    Argument(u32),

    Local(Local),
}

impl Value {
    pub fn local(&self) -> Option<Local> {
        match self {
            Value::Local(local) => Some(*local),
            _ => None,
        }
    }
}

/// Firma de una función, compartida entre su definición y sus llamadas.
#[derive(Debug, PartialEq, Eq)]
pub struct Signature {
    pub name: Rc<str>,
    pub void: bool,
    pub parameters: u32,
}

#[derive(Clone, Debug)]
pub struct Instruction {
    pub output: Option<Local>,
    pub op: Op,
}

#[derive(Clone, Debug)]
pub enum Op {
    /// Espacio para un escalar.
    Alloca,

    /// Espacio contiguo de varias palabras en el marco.
    ArrayAlloca(u32),

    Load(Value),

    Store {
        value: Value,
        target: Value,
    },

    Binary(BinOp, Value, Value),

    Compare(CmpOp, Value, Value),

    ZExt(Value),

    Phi([(Value, Label); 2]),

    /// `base + 4 * offset`
    ElementPtr {
        base: Value,
        offset: Value,
    },

    Jump(Label),

    Branch {
        condition: Value,
        then: Label,
        otherwise: Label,
    },

    Call {
        target: Rc<Signature>,
        arguments: Vec<Value>,
    },

    Ret(Value),

    RetVoid,
}

impl Op {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Op::Jump(_) | Op::Branch { .. } | Op::Ret(_) | Op::RetVoid
        )
    }

    /// Todos los valores leídos por la instrucción.
    pub fn operands(&self) -> Vec<&Value> {
        match self {
            Op::Alloca | Op::ArrayAlloca(_) | Op::Jump(_) | Op::RetVoid => Vec::new(),
            Op::Load(value) | Op::ZExt(value) | Op::Ret(value) => vec![value],
            Op::Store { value, target } => vec![value, target],
            Op::Binary(_, lhs, rhs) | Op::Compare(_, lhs, rhs) => vec![lhs, rhs],
            Op::Phi([(a, _), (b, _)]) => vec![a, b],
            Op::ElementPtr { base, offset } => vec![base, offset],
            Op::Branch { condition, .. } => vec![condition],
            Op::Call { arguments, .. } => arguments.iter().collect(),
        }
    }

    pub fn successors(&self) -> Vec<Label> {
        match self {
            Op::Jump(target) => vec![*target],
            Op::Branch {
                then, otherwise, ..
            } => vec![*then, *otherwise],
            _ => Vec::new(),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug)]
pub struct Block {
    pub name: &'static str,
    pub instructions: Vec<Instruction>,
}

impl Block {
    pub fn terminator(&self) -> Option<&Instruction> {
        self.instructions
            .last()
            .filter(|instruction| instruction.op.is_terminator())
    }
}

pub struct Function {
    pub signature: Rc<Signature>,

    /// Bloques indexados por [`Label`].
    pub blocks: Vec<Block>,

    /// Orden de emisión de los bloques.
    pub layout: Vec<Label>,

    /// Cantidad de valores locales definidos.
    pub locals: u32,
}

impl Function {
    pub fn block(&self, label: Label) -> &Block {
        &self.blocks[label.0 as usize]
    }

    /// Recorre los bloques en orden de emisión.
    pub fn iter(&self) -> impl Iterator<Item = (Label, &Block)> {
        self.layout.iter().map(move |&label| (label, self.block(label)))
    }

    /// Nombre legible y único de un bloque.
    pub fn label_name(&self, label: Label) -> String {
        format!("{}{}", self.block(label).name, label.0)
    }
}

impl Display for Value {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Const(constant) => write!(fmt, "{}", constant),
            Value::Global(global) => write!(fmt, "@{}", global.name),
            Value::Argument(index) => write!(fmt, "%arg{}", index),
            Value::Local(Local(local)) => write!(fmt, "%{}", local),
        }
    }
}

impl Display for BinOp {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::Div => "sdiv",
            BinOp::Rem => "srem",
        };

        fmt.write_str(name)
    }
}

impl Display for CmpOp {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CmpOp::Eq => "eq",
            CmpOp::Ne => "ne",
            CmpOp::Lt => "slt",
            CmpOp::Le => "sle",
            CmpOp::Gt => "sgt",
            CmpOp::Ge => "sge",
        };

        fmt.write_str(name)
    }
}

impl Display for Module {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        for global in &self.globals {
            write!(fmt, "@{} = global [", global.name)?;
            for (i, word) in global.init.iter().enumerate() {
                if i > 0 {
                    fmt.write_str(", ")?;
                }

                write!(fmt, "{}", word)?;
            }

            writeln!(fmt, "]")?;
        }

        for function in &self.functions {
            writeln!(fmt)?;
            write!(fmt, "{}", function)?;
        }

        Ok(())
    }
}

impl Display for Function {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let signature = &self.signature;
        let returns = if signature.void { "void" } else { "int" };

        write!(fmt, "define {} @{}(", returns, signature.name)?;
        for i in 0..signature.parameters {
            if i > 0 {
                fmt.write_str(", ")?;
            }

            write!(fmt, "{}", Value::Argument(i))?;
        }

        writeln!(fmt, ") {{")?;
        for (label, block) in self.iter() {
            writeln!(fmt, "{}:", self.label_name(label))?;
            for instruction in &block.instructions {
                fmt.write_str("  ")?;
                self.write_instruction(fmt, instruction)?;
                writeln!(fmt)?;
            }
        }

        writeln!(fmt, "}}")
    }
}

impl Function {
    /// Escribe una instrucción en formato textual, sin salto de línea.
    pub fn write_instruction<W: fmt::Write>(
        &self,
        out: &mut W,
        instruction: &Instruction,
    ) -> fmt::Result {
        if let Some(Local(output)) = instruction.output {
            write!(out, "%{} = ", output)?;
        }

        let label = |label: Label| self.label_name(label);
        match &instruction.op {
            Op::Alloca => write!(out, "alloca"),
            Op::ArrayAlloca(words) => write!(out, "alloca [{}]", words),
            Op::Load(source) => write!(out, "load {}", source),
            Op::Store { value, target } => write!(out, "store {}, {}", value, target),
            Op::Binary(op, lhs, rhs) => write!(out, "{} {}, {}", op, lhs, rhs),
            Op::Compare(op, lhs, rhs) => write!(out, "icmp {} {}, {}", op, lhs, rhs),
            Op::ZExt(value) => write!(out, "zext {}", value),

            Op::Phi([(a, from_a), (b, from_b)]) => write!(
                out,
                "phi [{}, %{}], [{}, %{}]",
                a,
                label(*from_a),
                b,
                label(*from_b)
            ),

            Op::ElementPtr { base, offset } => write!(out, "getelementptr {}, {}", base, offset),
            Op::Jump(target) => write!(out, "br %{}", label(*target)),

            Op::Branch {
                condition,
                then,
                otherwise,
            } => write!(
                out,
                "br {}, %{}, %{}",
                condition,
                label(*then),
                label(*otherwise)
            ),

            Op::Call { target, arguments } => {
                write!(out, "call @{}(", target.name)?;
                for (i, argument) in arguments.iter().enumerate() {
                    if i > 0 {
                        out.write_str(", ")?;
                    }

                    write!(out, "{}", argument)?;
                }

                out.write_str(")")
            }

            Op::Ret(value) => write!(out, "ret {}", value),
            Op::RetVoid => write!(out, "ret void"),
        }
    }
}
