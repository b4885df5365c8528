//! Compilador para SysY.
//!
//! # Front end
//! Cada programa deriva de un único archivo de código fuente.
//! Este archivo se somete primero a análisis léxico en [`lex`], de
//! lo cual se obtiene un flujo de tokens. El flujo de tokens se
//! dispone en un AST por medio de análisis sintáctico en [`parse`].
//! El árbol sintáctico es validado por análisis semántico en
//! [`semantic`], sobre el modelo de tipos y ámbitos de [`scope`].
//! Un programa válido se traduce en [`lower`] a la representación
//! intermedia descrita en [`ir`], con lo cual concluyen las fases
//! delanteras del compilador.
//!
//! # Back end
//! En esta sección el compilador deja de ser agnóstico al sistema
//! objetivo. Es en este segmento donde ocurre generación de código
//! ensamblador RV32IM y asignación de registros a valores en
//! [`target`], concluyendo con ensamblado, enlazado y emisión del
//! ejecutable final en [`link`]. Los aspectos de ensamblado y enlazado
//! se delegan a una toolchain de GCC para RISC-V.

#[macro_use]
mod macros;

pub mod error;
pub mod ir;
pub mod lex;
pub mod link;
pub mod lower;
pub mod parse;
pub mod scope;
pub mod semantic;
pub mod source;

mod arch;
mod codegen;

/// Emisión de código.
///
/// Este módulo reexporta suficientes ítems internos relacionados a
/// generación de código para traducir IR a ensamblador RISC-V.
pub mod target {
    pub use crate::codegen::{emit, Config, EmitOptions};
}
