//! Generación de código.
//!
//! Por cada función se aplana el grafo de control en [`live`], se
//! calculan rangos de vida, se planea la ubicación de cada valor en
//! [`regs`] y finalmente se seleccionan instrucciones en
//! [`crate::arch::riscv`]. Las variables globales se emiten en la
//! sección `.data` y el código en `.text`.

use std::io::{self, Write};

use bitflags::bitflags;
use log::debug;

use crate::{
    arch::{
        riscv::{Emitter, Reg},
        Register,
    },
    ir::{Function, Label, Module},
};

pub(crate) mod live;
pub(crate) mod regs;

bitflags! {
    /// Opciones de emisión.
    pub struct EmitOptions: u32 {
        /// Emitir un punto de entrada `_start` que llama a `main` y
        /// termina el proceso con su resultado.
        const START_STUB = 0x01;

        /// Acompañar el código de cada instrucción intermedia con
        /// un comentario que la describe.
        const ANNOTATE = 0x02;
    }
}

/// Parámetros de generación de código.
#[derive(Copy, Clone, Debug)]
pub struct Config {
    /// Cantidad de registros disponibles para asignación.
    pub registers: usize,
    pub options: EmitOptions,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            registers: Reg::FILE.len(),
            options: EmitOptions::START_STUB,
        }
    }
}

/// Contexto de emisión de una función.
pub struct Context<'a, W> {
    output: &'a mut W,
    function: &'a Function,
    options: EmitOptions,
}

impl<'a, W: Write> Context<'a, W> {
    pub fn output(&mut self) -> &mut W {
        &mut *self.output
    }

    pub fn function(&self) -> &'a Function {
        self.function
    }

    pub fn options(&self) -> EmitOptions {
        self.options
    }

    /// Símbolo local de ensamblador para un bloque.
    pub fn label(&self, label: Label) -> String {
        format!(
            ".L{}_{}",
            self.function.signature.name,
            self.function.label_name(label)
        )
    }
}

/// Traduce un módulo completo a ensamblador.
pub fn emit<W: Write>(module: &Module, config: &Config, output: &mut W) -> io::Result<()> {
    if !module.globals.is_empty() {
        writeln!(output, ".data")?;
        for global in &module.globals {
            writeln!(output, ".align 2\n{}:", global.name)?;
            for word in &global.init {
                writeln!(output, "\t.word\t{}", word)?;
            }
        }

        writeln!(output)?;
    }

    writeln!(output, ".text")?;

    if config.options.contains(EmitOptions::START_STUB) {
        writeln!(output, ".globl _start\n_start:")?;
        writeln!(output, "\t{:8}main", "call")?;
        writeln!(output, "\t{:8}a7, 93", "li")?;
        writeln!(output, "\tecall")?;
    }

    let pool = &Reg::FILE[..config.registers.min(Reg::FILE.len())];

    for function in &module.functions {
        let name = &function.signature.name;
        writeln!(output, "\n.globl {0}\n{0}:", name)?;

        let flat = live::flatten(function);
        let liveness = live::analyze(function, &flat);
        let regs = regs::Allocations::plan(&liveness.intervals, pool, liveness.max_live);

        debug!(
            "{}: {} lines, {} blocks",
            name,
            flat.lines.len(),
            flat.blocks.len()
        );

        let cx = Context {
            output: &mut *output,
            function,
            options: config.options,
        };

        Emitter::new(cx, &flat, regs).function(&flat)?;
    }

    Ok(())
}
