//! Implementación para RISC-V RV32IM.
//!
//! # Convención de llamada
//! Se sigue la ABI ILP32: los primeros ocho argumentos se colocan en
//! `a0`-`a7`, el resto en el área de salida al fondo del marco del
//! invocador, y el valor de retorno se entrega en `a0`. Los valores
//! del programa solo se asignan a `s0`-`s11`, que el invocado debe
//! preservar, por lo que sobreviven a las llamadas sin trabajo extra.
//!
//! # Marco de pila
//! De `sp` hacia arriba: área de salida para argumentos, espacios de
//! spill, arreglos locales, registros `s` preservados y `ra`. El tamaño
//! total se alinea a 16 bytes. Los argumentos entrantes del noveno en
//! adelante se encuentran justo encima del marco.

use std::{
    fmt,
    io::{self, Write},
};

use log::debug;

use super::Register;
use crate::{
    codegen::{
        live::{Flat, Line},
        regs::{Allocations, Location},
        Context, EmitOptions,
    },
    ir::{BinOp, CmpOp, Instruction, Label, Local, Op, Value},
};

/// Esta es una arquitectura de 32 bits.
const VALUE_SIZE: u32 = 4;

/// Registro de procesador.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reg {
    Zero,
    Ra,
    Sp,
    T(u8),
    S(u8),
    A(u8),
}

impl Reg {
    /// Argumentos que se pasan en registros.
    const MAX_ARGS: u32 = 8;

    // Temporales fuera del archivo asignable, reservados para el emisor
    const LHS: Reg = Reg::T(0);
    const RHS: Reg = Reg::T(1);
    const RESULT: Reg = Reg::T(2);
    const ADDRESS: Reg = Reg::T(3);
    const FRAME: Reg = Reg::T(4);

    fn argument(index: u32) -> Reg {
        debug_assert!(index < Reg::MAX_ARGS);
        Reg::A(index as u8)
    }
}

impl Register for Reg {
    const FILE: &'static [Self] = &[
        Reg::S(0),
        Reg::S(1),
        Reg::S(2),
        Reg::S(3),
        Reg::S(4),
        Reg::S(5),
        Reg::S(6),
        Reg::S(7),
        Reg::S(8),
        Reg::S(9),
        Reg::S(10),
        Reg::S(11),
    ];

    const RETURN: Self = Reg::A(0);
}

impl fmt::Display for Reg {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reg::Zero => formatter.write_str("zero"),
            Reg::Ra => formatter.write_str("ra"),
            Reg::Sp => formatter.write_str("sp"),
            Reg::T(n) => write!(formatter, "t{}", n),
            Reg::S(n) => write!(formatter, "s{}", n),
            Reg::A(n) => write!(formatter, "a{}", n),
        }
    }
}

/// Qué representa cada local para efectos de emisión.
#[derive(Copy, Clone, Debug)]
enum Kind {
    /// Resultado de una instrucción.
    Value,

    /// Variable escalar. Su ubicación guarda directamente el contenido
    /// de la variable, no una dirección.
    Scalar,

    /// Arreglo local, con su desplazamiento en palabras dentro del
    /// área de arreglos.
    Array(u32),
}

/// Disposición del marco, en bytes desde `sp`.
struct Frame {
    size: u32,
    spills: u32,
    arrays: u32,
    saved: u32,
    ra: u32,
    preserved: Vec<Reg>,
}

/// Emisión de código para una función.
pub struct Emitter<'a, W> {
    cx: Context<'a, W>,
    regs: Allocations<Reg>,
    kinds: Vec<Kind>,
    frame: Frame,
}

impl<'a, W: Write> Emitter<'a, W> {
    pub fn new(cx: Context<'a, W>, flat: &Flat<'a>, regs: Allocations<Reg>) -> Self {
        let function = cx.function();

        let mut kinds = vec![Kind::Value; function.locals as usize];
        let mut array_words = 0;
        let mut outgoing = 0;

        for line in &flat.lines {
            let instruction = match line {
                Line::Instruction(instruction) => instruction,
                Line::Copy { .. } => continue,
            };

            match (&instruction.op, instruction.output) {
                (Op::Alloca, Some(Local(local))) => kinds[local as usize] = Kind::Scalar,

                (Op::ArrayAlloca(words), Some(Local(local))) => {
                    kinds[local as usize] = Kind::Array(array_words);
                    array_words += words;
                }

                (Op::Call { arguments, .. }, _) => {
                    let on_stack = (arguments.len() as u32).saturating_sub(Reg::MAX_ARGS);
                    outgoing = outgoing.max(on_stack * VALUE_SIZE);
                }

                _ => (),
            }
        }

        let preserved = regs.used().to_vec();

        let spills = outgoing;
        let arrays = spills + regs.slots() * VALUE_SIZE;
        let saved = arrays + array_words * VALUE_SIZE;
        let ra = saved + preserved.len() as u32 * VALUE_SIZE;
        let size = (ra + VALUE_SIZE + 15) & !15;

        debug!(
            "frame of {}: {} bytes, {} spill slots, {} array words, {} preserved registers",
            function.signature.name,
            size,
            regs.slots(),
            array_words,
            preserved.len()
        );

        Emitter {
            cx,
            regs,
            kinds,
            frame: Frame {
                size,
                spills,
                arrays,
                saved,
                ra,
                preserved,
            },
        }
    }

    /// Emite la función completa, de prólogo a epílogos.
    pub fn function(mut self, flat: &Flat<'a>) -> io::Result<()> {
        self.prologue()?;

        for (index, (label, lines)) in flat.blocks.iter().enumerate() {
            let label_symbol = self.cx.label(*label);
            writeln!(self.cx.output(), "{}:", label_symbol)?;

            let next = flat.blocks.get(index + 1).map(|(next, _)| *next);
            for line in &flat.lines[lines.clone()] {
                if self.cx.options().contains(EmitOptions::ANNOTATE) {
                    self.annotate(line)?;
                }

                self.line(line, next)?;
            }
        }

        Ok(())
    }

    fn prologue(&mut self) -> io::Result<()> {
        let size = self.frame.size as i32;
        self.move_sp(-size)?;

        let ra = self.frame.ra;
        self.stack("sw", Reg::Ra, ra)?;

        for (i, reg) in self.frame.preserved.clone().into_iter().enumerate() {
            let offset = self.frame.saved + i as u32 * VALUE_SIZE;
            self.stack("sw", reg, offset)?;
        }

        Ok(())
    }

    fn epilogue(&mut self) -> io::Result<()> {
        for (i, reg) in self.frame.preserved.clone().into_iter().enumerate() {
            let offset = self.frame.saved + i as u32 * VALUE_SIZE;
            self.stack("lw", reg, offset)?;
        }

        let ra = self.frame.ra;
        self.stack("lw", Reg::Ra, ra)?;

        let size = self.frame.size as i32;
        self.move_sp(size)?;

        emit!(self.cx, "ret")
    }

    fn annotate(&mut self, line: &Line<'_>) -> io::Result<()> {
        let mut text = String::new();
        let written = match line {
            Line::Instruction(instruction) => {
                self.cx.function().write_instruction(&mut text, instruction)
            }

            Line::Copy {
                output: Local(output),
                value,
            } => {
                use std::fmt::Write;
                write!(text, "%{} = copy {}", output, value)
            }
        };

        written.map_err(|_| io::Error::new(io::ErrorKind::Other, "failed to format IR"))?;
        writeln!(self.cx.output(), "\t# {}", text)
    }

    fn line(&mut self, line: &Line<'_>, next: Option<Label>) -> io::Result<()> {
        match line {
            Line::Copy { output, value } => self.copy(*output, value),
            Line::Instruction(instruction) => self.instruction(instruction, next),
        }
    }

    fn instruction(&mut self, instruction: &Instruction, next: Option<Label>) -> io::Result<()> {
        let output = instruction.output;

        match &instruction.op {
            Op::Alloca | Op::ArrayAlloca(_) | Op::Phi(_) => Ok(()),

            Op::ZExt(value) => self.copy(defined(output), value),

            Op::Load(source) => self.load(defined(output), source),
            Op::Store { value, target } => self.store(value, target),

            Op::Binary(op, lhs, rhs) => {
                let output = defined(output);
                let lhs = self.read(lhs, Reg::LHS)?;
                let rhs = self.read(rhs, Reg::RHS)?;
                let dest = self.dest(output);

                let opcode = match op {
                    BinOp::Add => "add",
                    BinOp::Sub => "sub",
                    BinOp::Mul => "mul",
                    BinOp::Div => "div",
                    BinOp::Rem => "rem",
                };

                emit!(self.cx, opcode, "{}, {}, {}", dest, lhs, rhs)?;
                self.commit(output, dest)
            }

            Op::Compare(op, lhs, rhs) => {
                let output = defined(output);
                let lhs = self.read(lhs, Reg::LHS)?;
                let rhs = self.read(rhs, Reg::RHS)?;
                let dest = self.dest(output);

                self.compare(*op, dest, lhs, rhs)?;
                self.commit(output, dest)
            }

            Op::ElementPtr { base, offset } => {
                let output = defined(output);
                let base = self.read(base, Reg::LHS)?;
                let offset = self.read(offset, Reg::RHS)?;
                let dest = self.dest(output);

                emit!(self.cx, "slli", "{}, {}, 2", Reg::RHS, offset)?;
                emit!(self.cx, "add", "{}, {}, {}", dest, base, Reg::RHS)?;
                self.commit(output, dest)
            }

            Op::Jump(target) => {
                if Some(*target) == next {
                    Ok(())
                } else {
                    let target = self.cx.label(*target);
                    emit!(self.cx, "j", "{}", target)
                }
            }

            Op::Branch {
                condition,
                then,
                otherwise,
            } => {
                let condition = self.read(condition, Reg::LHS)?;
                let then_symbol = self.cx.label(*then);
                let otherwise_symbol = self.cx.label(*otherwise);

                if Some(*then) == next {
                    emit!(self.cx, "beqz", "{}, {}", condition, otherwise_symbol)
                } else {
                    emit!(self.cx, "bnez", "{}, {}", condition, then_symbol)?;
                    if Some(*otherwise) != next {
                        emit!(self.cx, "j", "{}", otherwise_symbol)?;
                    }

                    Ok(())
                }
            }

            Op::Call { target, arguments } => {
                // Argumentos del noveno en adelante van al área de salida
                for (i, argument) in arguments.iter().enumerate().skip(Reg::MAX_ARGS as usize) {
                    let reg = self.read(argument, Reg::LHS)?;
                    let offset = (i as u32 - Reg::MAX_ARGS) * VALUE_SIZE;
                    self.stack("sw", reg, offset)?;
                }

                for (i, argument) in arguments.iter().enumerate().take(Reg::MAX_ARGS as usize) {
                    self.read_into(argument, Reg::argument(i as u32))?;
                }

                emit!(self.cx, "call", "{}", target.name)?;

                match output {
                    Some(output) => {
                        let dest = self.dest(output);
                        self.mv(dest, Reg::RETURN)?;
                        self.commit(output, dest)
                    }

                    None => Ok(()),
                }
            }

            Op::Ret(value) => {
                self.read_into(value, Reg::RETURN)?;
                self.epilogue()
            }

            Op::RetVoid => self.epilogue(),
        }
    }

    fn compare(&mut self, op: CmpOp, dest: Reg, lhs: Reg, rhs: Reg) -> io::Result<()> {
        match op {
            CmpOp::Lt => emit!(self.cx, "slt", "{}, {}, {}", dest, lhs, rhs),
            CmpOp::Gt => emit!(self.cx, "slt", "{}, {}, {}", dest, rhs, lhs),

            CmpOp::Le => {
                emit!(self.cx, "slt", "{}, {}, {}", dest, rhs, lhs)?;
                emit!(self.cx, "xori", "{0}, {0}, 1", dest)
            }

            CmpOp::Ge => {
                emit!(self.cx, "slt", "{}, {}, {}", dest, lhs, rhs)?;
                emit!(self.cx, "xori", "{0}, {0}, 1", dest)
            }

            CmpOp::Eq => {
                emit!(self.cx, "sub", "{}, {}, {}", dest, lhs, rhs)?;
                emit!(self.cx, "seqz", "{0}, {0}", dest)
            }

            CmpOp::Ne => {
                emit!(self.cx, "sub", "{}, {}, {}", dest, lhs, rhs)?;
                emit!(self.cx, "snez", "{0}, {0}", dest)
            }
        }
    }

    fn copy(&mut self, output: Local, value: &Value) -> io::Result<()> {
        let dest = self.dest(output);
        self.read_into(value, dest)?;
        self.commit(output, dest)
    }

    fn load(&mut self, output: Local, source: &Value) -> io::Result<()> {
        let dest = self.dest(output);

        match source {
            Value::Global(global) => {
                emit!(self.cx, "la", "{}, {}", Reg::ADDRESS, global.name)?;
                emit!(self.cx, "lw", "{}, 0({})", dest, Reg::ADDRESS)?;
            }

            // La ubicación de un escalar ya contiene su valor
            Value::Local(local) if self.is_scalar(*local) => self.read_into(source, dest)?,

            _ => {
                let pointer = self.read(source, Reg::LHS)?;
                emit!(self.cx, "lw", "{}, 0({})", dest, pointer)?;
            }
        }

        self.commit(output, dest)
    }

    fn store(&mut self, value: &Value, target: &Value) -> io::Result<()> {
        match target {
            Value::Global(global) => {
                let value = self.read(value, Reg::LHS)?;
                emit!(self.cx, "la", "{}, {}", Reg::ADDRESS, global.name)?;
                emit!(self.cx, "sw", "{}, 0({})", value, Reg::ADDRESS)
            }

            Value::Local(local) if self.is_scalar(*local) => match self.regs.location(*local) {
                Location::Register(reg) => self.read_into(value, reg),
                Location::Slot(slot) => {
                    let value = self.read(value, Reg::LHS)?;
                    let offset = self.slot_offset(slot);
                    self.stack("sw", value, offset)
                }
            },

            _ => {
                let value = self.read(value, Reg::LHS)?;
                let pointer = self.read(target, Reg::RHS)?;
                emit!(self.cx, "sw", "{}, 0({})", value, pointer)
            }
        }
    }

    /// Obtiene un registro que contiene el valor indicado. Si el valor no
    /// reside en un registro, se materializa en `scratch`.
    fn read(&mut self, value: &Value, scratch: Reg) -> io::Result<Reg> {
        match value {
            Value::Const(0) => Ok(Reg::Zero),

            Value::Const(constant) => {
                emit!(self.cx, "li", "{}, {}", scratch, constant)?;
                Ok(scratch)
            }

            Value::Global(global) => {
                emit!(self.cx, "la", "{}, {}", scratch, global.name)?;
                Ok(scratch)
            }

            Value::Argument(index) if *index < Reg::MAX_ARGS => Ok(Reg::argument(*index)),

            Value::Argument(index) => {
                let offset = self.frame.size + (index - Reg::MAX_ARGS) * VALUE_SIZE;
                self.stack("lw", scratch, offset)?;
                Ok(scratch)
            }

            Value::Local(local) => match self.kinds[local.0 as usize] {
                Kind::Array(words) => {
                    let offset = self.frame.arrays + words * VALUE_SIZE;
                    self.stack_address(scratch, offset)?;
                    Ok(scratch)
                }

                Kind::Value | Kind::Scalar => match self.regs.location(*local) {
                    Location::Register(reg) => Ok(reg),
                    Location::Slot(slot) => {
                        let offset = self.slot_offset(slot);
                        self.stack("lw", scratch, offset)?;
                        Ok(scratch)
                    }
                },
            },
        }
    }

    /// Coloca un valor en un registro específico.
    fn read_into(&mut self, value: &Value, reg: Reg) -> io::Result<()> {
        let source = self.read(value, reg)?;
        self.mv(reg, source)
    }

    /// Registro en el que se calcula el resultado de una local.
    fn dest(&self, local: Local) -> Reg {
        match self.regs.location(local) {
            Location::Register(reg) => reg,
            Location::Slot(_) => Reg::RESULT,
        }
    }

    /// Completa la escritura de una local calculada en `reg`.
    fn commit(&mut self, local: Local, reg: Reg) -> io::Result<()> {
        match self.regs.location(local) {
            Location::Register(_) => Ok(()),
            Location::Slot(slot) => {
                let offset = self.slot_offset(slot);
                self.stack("sw", reg, offset)
            }
        }
    }

    fn mv(&mut self, target: Reg, source: Reg) -> io::Result<()> {
        if target == source {
            Ok(())
        } else {
            emit!(self.cx, "mv", "{}, {}", target, source)
        }
    }

    fn is_scalar(&self, Local(local): Local) -> bool {
        matches!(self.kinds[local as usize], Kind::Scalar)
    }

    fn slot_offset(&self, slot: u32) -> u32 {
        self.frame.spills + slot * VALUE_SIZE
    }

    /// Acceso a memoria relativo a `sp`.
    fn stack(&mut self, opcode: &str, reg: Reg, offset: u32) -> io::Result<()> {
        if fits_immediate(offset as i32) {
            emit!(self.cx, opcode, "{}, {}({})", reg, offset, Reg::Sp)
        } else {
            emit!(self.cx, "li", "{}, {}", Reg::ADDRESS, offset)?;
            emit!(self.cx, "add", "{0}, {0}, {1}", Reg::ADDRESS, Reg::Sp)?;
            emit!(self.cx, opcode, "{}, 0({})", reg, Reg::ADDRESS)
        }
    }

    /// Calcula `sp + offset`.
    fn stack_address(&mut self, reg: Reg, offset: u32) -> io::Result<()> {
        if fits_immediate(offset as i32) {
            emit!(self.cx, "addi", "{}, {}, {}", reg, Reg::Sp, offset)
        } else {
            emit!(self.cx, "li", "{}, {}", reg, offset)?;
            emit!(self.cx, "add", "{0}, {0}, {1}", reg, Reg::Sp)
        }
    }

    /// Corrige el registro de puntero de stack.
    fn move_sp(&mut self, offset: i32) -> io::Result<()> {
        if fits_immediate(offset) {
            emit!(self.cx, "addi", "{0}, {0}, {1}", Reg::Sp, offset)
        } else {
            emit!(self.cx, "li", "{}, {}", Reg::FRAME, offset)?;
            emit!(self.cx, "add", "{0}, {0}, {1}", Reg::Sp, Reg::FRAME)
        }
    }
}

/// Inmediatos de 12 bits con signo.
fn fits_immediate(value: i32) -> bool {
    (-2048..2048).contains(&value)
}

/// Toda instrucción que produce un valor tiene una local de salida.
fn defined(output: Option<Local>) -> Local {
    output.expect("value-producing instruction without output")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_names() {
        let names: Vec<String> = [Reg::Zero, Reg::Ra, Reg::Sp, Reg::T(3), Reg::S(11), Reg::A(0)]
            .iter()
            .map(ToString::to_string)
            .collect();

        assert_eq!(names, ["zero", "ra", "sp", "t3", "s11", "a0"]);
    }

    #[test]
    fn immediates() {
        assert!(fits_immediate(2047));
        assert!(fits_immediate(-2048));
        assert!(!fits_immediate(2048));
        assert!(!fits_immediate(-2049));
    }
}
