//! Análisis de vida.
//!
//! Los bloques de una función se aplanan en orden de emisión a una
//! secuencia de líneas. Los nodos phi se eliminan en este punto: cada
//! predecesor recibe, justo antes de su instrucción terminal, una copia
//! del valor entrante hacia la salida del phi.
//!
//! El rango de vida de un valor va de la primera línea que lo define
//! hasta la última que lo lee. Un rango que cruza la cabecera de un
//! ciclo se extiende hasta el salto de regreso de ese ciclo, de forma
//! que el valor sobreviva a todas las iteraciones.

use std::{collections::HashMap, ops::Range};

use crate::ir::{Function, Instruction, Label, Local, Op, Value};

/// Una línea del flujo aplanado.
#[derive(Debug)]
pub enum Line<'a> {
    Instruction(&'a Instruction),

    /// Copia de un valor entrante hacia la salida de un phi.
    Copy { output: Local, value: &'a Value },
}

impl Line<'_> {
    pub fn output(&self) -> Option<Local> {
        match self {
            Line::Instruction(instruction) => instruction.output,
            Line::Copy { output, .. } => Some(*output),
        }
    }

    /// Valores leídos en esta línea. Los operandos de un phi se leen
    /// en las copias de sus predecesores y no en el phi mismo.
    pub fn operands(&self) -> Vec<&Value> {
        match self {
            Line::Instruction(Instruction {
                op: Op::Phi(_), ..
            }) => Vec::new(),

            Line::Instruction(instruction) => instruction.op.operands(),
            Line::Copy { value, .. } => vec![*value],
        }
    }

    fn successors(&self) -> Vec<Label> {
        match self {
            Line::Instruction(instruction) => instruction.op.successors(),
            Line::Copy { .. } => Vec::new(),
        }
    }
}

/// Función aplanada.
pub struct Flat<'a> {
    pub lines: Vec<Line<'a>>,

    /// Rango de líneas de cada bloque, en orden de emisión.
    pub blocks: Vec<(Label, Range<usize>)>,
}

pub fn flatten(function: &Function) -> Flat<'_> {
    let mut copies: HashMap<Label, Vec<(Local, &Value)>> = HashMap::new();
    for (_, block) in function.iter() {
        for instruction in &block.instructions {
            if let (Some(output), Op::Phi(incoming)) = (instruction.output, &instruction.op) {
                for (value, from) in incoming {
                    copies.entry(*from).or_default().push((output, value));
                }
            }
        }
    }

    let mut lines = Vec::new();
    let mut blocks = Vec::new();

    for (label, block) in function.iter() {
        let start = lines.len();

        let (body, terminator) = match block.instructions.split_last() {
            Some((last, body)) if last.op.is_terminator() => (body, Some(last)),
            _ => (&block.instructions[..], None),
        };

        lines.extend(body.iter().map(Line::Instruction));
        if let Some(copies) = copies.get(&label) {
            lines.extend(
                copies
                    .iter()
                    .map(|&(output, value)| Line::Copy { output, value }),
            );
        }

        lines.extend(terminator.map(Line::Instruction));
        blocks.push((label, start..lines.len()));
    }

    Flat { lines, blocks }
}

/// Rango de vida cerrado `[start, end]` sobre el índice de líneas.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Interval {
    pub start: usize,
    pub end: usize,
}

pub struct Liveness {
    /// Rango de cada local, indexado por número de local. Las locales
    /// que no participan de asignación de registros no tienen rango.
    pub intervals: Vec<Option<Interval>>,

    /// Máxima cantidad de rangos simultáneos en una misma línea.
    pub max_live: usize,
}

pub fn analyze(function: &Function, flat: &Flat<'_>) -> Liveness {
    // Los arreglos locales viven en el marco y nunca en registros
    let mut excluded = vec![false; function.locals as usize];
    for (_, block) in function.iter() {
        for instruction in &block.instructions {
            if let (Some(Local(local)), Op::ArrayAlloca(_)) = (instruction.output, &instruction.op)
            {
                excluded[local as usize] = true;
            }
        }
    }

    let mut intervals: Vec<Option<Interval>> = vec![None; function.locals as usize];
    let mut touch = |Local(local): Local, line: usize| {
        let local = local as usize;
        if excluded[local] {
            return;
        }

        let interval = intervals[local].get_or_insert(Interval {
            start: line,
            end: line,
        });

        interval.start = interval.start.min(line);
        interval.end = interval.end.max(line);
    };

    for (line, entry) in flat.lines.iter().enumerate() {
        for local in entry.operands().into_iter().filter_map(Value::local) {
            touch(local, line);
        }

        if let Some(output) = entry.output() {
            touch(output, line);
        }
    }

    extend_loops(flat, &mut intervals);

    Liveness {
        max_live: max_live(&intervals, flat.lines.len()),
        intervals,
    }
}

fn extend_loops(flat: &Flat<'_>, intervals: &mut [Option<Interval>]) {
    let starts: HashMap<Label, usize> = flat
        .blocks
        .iter()
        .map(|(label, lines)| (*label, lines.start))
        .collect();

    let back_edges: Vec<(usize, usize)> = flat
        .lines
        .iter()
        .enumerate()
        .flat_map(|(line, entry)| {
            let starts = &starts;
            entry
                .successors()
                .into_iter()
                .map(move |target| (starts[&target], line))
        })
        .filter(|&(header, line)| header <= line)
        .collect();

    let mut changed = true;
    while changed {
        changed = false;

        for &(header, back) in &back_edges {
            for interval in intervals.iter_mut().flatten() {
                if interval.start < header && header <= interval.end && interval.end < back {
                    interval.end = back;
                    changed = true;
                }
            }
        }
    }
}

fn max_live(intervals: &[Option<Interval>], lines: usize) -> usize {
    let mut delta = vec![0isize; lines + 1];
    for interval in intervals.iter().flatten() {
        delta[interval.start] += 1;
        delta[interval.end + 1] -= 1;
    }

    delta
        .iter()
        .scan(0isize, |live, delta| {
            *live += delta;
            Some(*live)
        })
        .max()
        .unwrap_or(0)
        .max(0) as usize
}
