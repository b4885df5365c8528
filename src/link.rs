//! Construcción de ejecutables.
//!
//! Una vez que se ha emitido código ensamblador, este debe ser
//! ensamblado y enlazado para producir un binario ejecutable. Ambas
//! operaciones se delegan a una toolchain de GCC para RISC-V.

use std::{
    io::BufWriter,
    path::Path,
    process::{Child, ChildStdin, Command, ExitStatus, Stdio},
    str::FromStr,
};

use bitflags::bitflags;
use log::debug;
use thiserror::Error;

bitflags! {
    /// Opciones a aplicar durante el enlazado.
    pub struct LinkOptions: u32 {
        /// Remover símbolos de depuración del ejecutable final.
        const STRIP = 0x01;
    }
}

/// Un error de ensamblado o enlazado.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum LinkerError {
    /// Ocurrió un evento de error de E/S durante la invocación
    /// de comandos externos.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// El enlazador inició su ejecución, pero falló en enlazar.
    #[error("Linker exited with status code {0:?}")]
    Failed(ExitStatus),
}

/// Plataforma objetivo.
///
/// Ambas plataformas comparten la ISA RV32IM y la ABI ILP32. Se
/// diferencian en la toolchain que las construye.
#[derive(Copy, Clone, Debug)]
pub enum Platform {
    /// Linux de 32 bits. El punto de entrada `_start` termina el
    /// proceso con la llamada al sistema `exit`.
    Linux,

    /// Ejecutable ELF sin sistema operativo, para simuladores.
    Elf,
}

impl FromStr for Platform {
    type Err = ();

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        match string {
            "linux" => Ok(Platform::Linux),
            "elf" => Ok(Platform::Elf),
            _ => Err(()),
        }
    }
}

/// Instancia del enlazador para un ejecutable definido.
pub struct Linker {
    child: Child,
    stdin: BufWriter<ChildStdin>,
}

impl Linker {
    /// Inicia una instancia del enlazador.
    ///
    /// El enlazador tratará de emitir un ejecutable y escribirlo a
    /// la ruta indicada por `output`.
    pub fn spawn<O>(platform: Platform, output: &O, opts: LinkOptions) -> Result<Self, LinkerError>
    where
        O: AsRef<Path>,
    {
        let command_name = platform.command();
        debug!("linking with {} into {}", command_name, output.as_ref().display());

        // El código emitido se entrega por stdin al ensamblador
        let mut command = Command::new(command_name);
        command
            .args(&["-march=rv32im", "-mabi=ilp32", "-nostdlib", "-static"])
            .arg("-o")
            .arg(output.as_ref())
            .args(&["-xassembler", "-"])
            .stdin(Stdio::piped());

        if opts.contains(LinkOptions::STRIP) {
            command.arg("-s");
        }

        let mut child = command.spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "linker stdin unavailable")
        })?;

        Ok(Linker {
            child,
            stdin: BufWriter::new(stdin),
        })
    }

    /// Obtiene la entrada estándar del proceso que espera recibir ensamblador.
    pub fn stdin(&mut self) -> &mut BufWriter<ChildStdin> {
        &mut self.stdin
    }

    /// Indica el fin del flujo de código y finaliza el enlazado.
    pub fn finish(self) -> Result<(), LinkerError> {
        let Linker { mut child, stdin } = self;
        stdin.into_inner().map_err(|error| error.into_error())?;

        let status = child.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(LinkerError::Failed(status))
        }
    }
}

impl Platform {
    fn command(self) -> &'static str {
        match self {
            Platform::Linux => "riscv32-linux-gnu-gcc",
            Platform::Elf => "riscv32-unknown-elf-gcc",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_names() {
        assert!(matches!("linux".parse::<Platform>(), Ok(Platform::Linux)));
        assert!(matches!("elf".parse::<Platform>(), Ok(Platform::Elf)));
        assert!("esp8266".parse::<Platform>().is_err());
    }
}
