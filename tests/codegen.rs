use std::collections::{BTreeSet, HashMap};

use sysyc::{
    ir::Module,
    lex::Lexer,
    parse, source,
    target::{self, Config, EmitOptions},
};

fn lower(text: &str) -> Module {
    let (start, chars) = source::consume_str(text, "test.sy");
    let tokens = Lexer::new(start.clone(), chars)
        .try_exhaustive()
        .expect("lexer error");

    let ast = parse::parse(tokens.iter(), start).expect("parser error");
    ast.check().expect("semantic errors");
    ast.lower().expect("lowering error")
}

fn compile_with(text: &str, config: &Config) -> String {
    let mut output = Vec::new();
    target::emit(&lower(text), config, &mut output).expect("emission failed");
    String::from_utf8(output).expect("assembly is not UTF-8")
}

fn compile(text: &str) -> String {
    compile_with(text, &Config::default())
}

/// Líneas no vacías con espacios normalizados.
fn lines(asm: &str) -> Vec<String> {
    asm.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect()
}

fn has(asm: &str, expected: &str) -> bool {
    lines(asm).iter().any(|line| line == expected)
}

/// Registros `s` mencionados en el código.
fn saved_registers(asm: &str) -> BTreeSet<String> {
    asm.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|word| {
            word.len() > 1 && word.starts_with('s') && word[1..].chars().all(|c| c.is_ascii_digit())
        })
        .map(String::from)
        .collect()
}

/// Intérprete de RV32IM para el subconjunto de instrucciones que
/// produce el emisor. Las direcciones de código son índices de
/// instrucción.
struct Cpu {
    text: Vec<(String, Vec<String>)>,
    labels: HashMap<String, usize>,
    symbols: HashMap<String, i32>,
    memory: HashMap<i32, i32>,
    regs: HashMap<String, i32>,
    fuel: u32,
}

impl Cpu {
    const DATA: i32 = 0x1000;
    const STACK: i32 = 0x10_0000;

    /// Contenido de registros nunca escritos.
    const POISON: i32 = 0x0bad_beef;

    fn load(asm: &str) -> Self {
        let mut cpu = Cpu {
            text: Vec::new(),
            labels: HashMap::new(),
            symbols: HashMap::new(),
            memory: HashMap::new(),
            regs: HashMap::new(),
            fuel: 1_000_000,
        };

        let mut data = false;
        let mut next = Self::DATA;

        for line in lines(asm) {
            if line.starts_with('#') || line.starts_with(".globl") || line.starts_with(".align") {
                continue;
            } else if line == ".data" || line == ".text" {
                data = line == ".data";
            } else if let Some(label) = line.strip_suffix(':') {
                if data {
                    cpu.symbols.insert(label.to_string(), next);
                } else {
                    cpu.labels.insert(label.to_string(), cpu.text.len());
                }
            } else if let Some(word) = line.strip_prefix(".word ") {
                cpu.memory.insert(next, word.parse().expect("bad word"));
                next += 4;
            } else {
                let instruction = match line.split_once(' ') {
                    Some((opcode, operands)) => (
                        opcode.to_string(),
                        operands.split(", ").map(String::from).collect(),
                    ),

                    None => (line.clone(), Vec::new()),
                };

                cpu.text.push(instruction);
            }
        }

        cpu.regs.insert("sp".to_string(), Self::STACK);
        cpu
    }

    fn get(&self, reg: &str) -> i32 {
        match reg {
            "zero" => 0,
            _ => self.regs.get(reg).copied().unwrap_or(Self::POISON),
        }
    }

    fn set(&mut self, reg: &str, value: i32) {
        assert_ne!(reg, "zero", "write to zero register");
        self.regs.insert(reg.to_string(), value);
    }

    /// Resuelve un operando de memoria `offset(base)`.
    fn address(&self, operand: &str) -> i32 {
        let (offset, base) = operand.split_once('(').expect("bad memory operand");
        let address = immediate(offset) + self.get(base.trim_end_matches(')'));

        assert_eq!(address % 4, 0, "misaligned access to {}", operand);
        assert!(address >= Self::DATA && address <= Self::STACK, "wild access to {}", address);
        address
    }

    fn target(&self, label: &str) -> usize {
        *self.labels.get(label).expect("undefined label")
    }

    /// Ejecuta desde `_start` hasta la llamada al sistema `exit`.
    fn run(mut self) -> i32 {
        let mut pc = self.target("_start");

        loop {
            self.fuel = self.fuel.checked_sub(1).expect("out of fuel");

            let (opcode, operands) = self.text[pc].clone();
            let operand = |i: usize| operands[i].as_str();
            pc += 1;

            match opcode.as_str() {
                "li" => self.set(operand(0), immediate(operand(1))),

                "la" => {
                    let address = *self.symbols.get(operand(1)).expect("undefined symbol");
                    self.set(operand(0), address);
                }

                "mv" => {
                    let value = self.get(operand(1));
                    self.set(operand(0), value);
                }

                "seqz" | "snez" => {
                    let zero = self.get(operand(1)) == 0;
                    self.set(operand(0), (zero == (opcode == "seqz")) as i32);
                }

                "addi" | "xori" | "slli" => {
                    let lhs = self.get(operand(1));
                    let rhs = immediate(operand(2));

                    let result = match opcode.as_str() {
                        "addi" => lhs.wrapping_add(rhs),
                        "xori" => lhs ^ rhs,
                        _ => lhs.wrapping_shl(rhs as u32),
                    };

                    self.set(operand(0), result);
                }

                "add" | "sub" | "mul" | "div" | "rem" | "slt" => {
                    let lhs = self.get(operand(1));
                    let rhs = self.get(operand(2));

                    let result = match opcode.as_str() {
                        "add" => lhs.wrapping_add(rhs),
                        "sub" => lhs.wrapping_sub(rhs),
                        "mul" => lhs.wrapping_mul(rhs),
                        "div" => lhs.wrapping_div(rhs),
                        "rem" => lhs.wrapping_rem(rhs),
                        _ => (lhs < rhs) as i32,
                    };

                    self.set(operand(0), result);
                }

                "lw" => {
                    let address = self.address(operand(1));
                    let value = self.memory.get(&address).copied().unwrap_or(0);
                    self.set(operand(0), value);
                }

                "sw" => {
                    let address = self.address(operand(1));
                    let value = self.get(operand(0));
                    self.memory.insert(address, value);
                }

                "j" => pc = self.target(operand(0)),

                "beqz" | "bnez" => {
                    let zero = self.get(operand(0)) == 0;
                    if zero == (opcode == "beqz") {
                        pc = self.target(operand(1));
                    }
                }

                "call" => {
                    self.set("ra", pc as i32);
                    pc = self.target(operand(0));
                }

                "ret" => pc = self.get("ra") as usize,

                "ecall" => {
                    assert_eq!(self.get("a7"), 93, "unexpected system call");
                    assert_eq!(self.get("sp"), Self::STACK, "unbalanced stack");
                    return self.get("a0");
                }

                other => panic!("unsupported instruction: {}", other),
            }
        }
    }
}

fn immediate(text: &str) -> i32 {
    text.parse().expect("bad immediate")
}

/// Ejecuta el programa con varios tamaños del archivo de registros.
fn exits_with(text: &str, expected: i32) {
    for &registers in &[1, 2, 3, 12] {
        let asm = compile_with(
            text,
            &Config {
                registers,
                ..Config::default()
            },
        );

        assert_eq!(
            Cpu::load(&asm).run(),
            expected,
            "wrong result with {} registers",
            registers
        );
    }
}

#[test]
fn sections_and_entry_point() {
    let asm = compile("int g = 5;\nint a[3] = {1, 2};\nint main() { return g; }\n");
    let lines = lines(&asm);

    let data = lines.iter().position(|line| line == ".data").expect("no .data");
    let text = lines.iter().position(|line| line == ".text").expect("no .text");
    assert!(data < text);

    let a = lines.iter().position(|line| line == "a:").expect("no label for a");
    assert_eq!(lines[a + 1..a + 4], [".word 1", ".word 2", ".word 0"]);

    assert!(has(&asm, "g:"));
    assert!(has(&asm, ".word 5"));
    assert!(has(&asm, ".globl main"));
    assert!(has(&asm, "main:"));

    assert!(has(&asm, "_start:"));
    assert!(has(&asm, "call main"));
    assert!(has(&asm, "li a7, 93"));
    assert!(has(&asm, "ecall"));

    assert!(has(&asm, "la t3, g"));
    assert!(has(&asm, "ret"));
}

#[test]
fn start_stub_is_optional() {
    let config = Config {
        options: EmitOptions::empty(),
        ..Config::default()
    };

    let asm = compile_with("int main() { return 0; }\n", &config);
    assert!(!asm.contains("_start"));
    assert!(!asm.contains(".data"));
    assert!(has(&asm, "mv a0, zero"));
}

#[test]
fn arithmetic_selection() {
    let asm = compile(
        "\
int main() {
    int a = 7;
    int b = 2;
    return a / b + a % b - a * b;
}
",
    );

    for opcode in &["div", "rem", "mul", "add", "sub"] {
        assert!(
            lines(&asm)
                .iter()
                .any(|line| line.starts_with(&format!("{} ", opcode))),
            "missing {}",
            opcode
        );
    }
}

#[test]
fn comparisons_use_set_less_than() {
    let asm = compile(
        "\
int main() {
    int a = 1;
    int b = 2;
    if (a <= b) return 1;
    if (a != b) return 2;
    return 0;
}
",
    );

    let lines = lines(&asm);
    assert!(lines.iter().any(|line| line.starts_with("slt ")));
    assert!(lines.iter().any(|line| line.starts_with("xori ") && line.ends_with(", 1")));
    assert!(lines.iter().any(|line| line.starts_with("snez ")));
}

#[test]
fn loops_branch_and_jump_back() {
    let asm = compile("int main() { int i = 0; while (i < 3) i = i + 1; return i; }\n");

    // La cabecera le sigue a la entrada y el cuerpo a la cabecera
    assert!(has(&asm, ".Lmain_while_cond1:"));
    assert!(lines(&asm)
        .iter()
        .any(|line| line.starts_with("beqz ") && line.ends_with(", .Lmain_while_next3")));

    assert!(has(&asm, "j .Lmain_while_cond1"));
    assert!(!has(&asm, "j .Lmain_while_body2"));
}

#[test]
fn calls_follow_the_calling_convention() {
    let asm = compile(
        "\
int sum(int a, int b, int c, int d, int e, int f, int g, int h, int i, int j) {
    return a + j;
}
int main() {
    return sum(1, 2, 3, 4, 5, 6, 7, 8, 9, 10);
}
",
    );

    assert!(has(&asm, "li a0, 1"));
    assert!(has(&asm, "li a7, 8"));
    assert!(has(&asm, "li t0, 9"));
    assert!(has(&asm, "sw t0, 0(sp)"));
    assert!(has(&asm, "li t0, 10"));
    assert!(has(&asm, "sw t0, 4(sp)"));
    assert!(has(&asm, "call sum"));

    // Marco de `main`: 8 bytes de área de salida, `s0` y `ra`
    assert!(has(&asm, "addi sp, sp, -16"));
    assert!(has(&asm, "sw s0, 8(sp)"));
    assert!(has(&asm, "sw ra, 12(sp)"));
    assert!(has(&asm, "lw ra, 12(sp)"));
    assert!(has(&asm, "addi sp, sp, 16"));
}

#[test]
fn values_survive_calls_in_saved_registers() {
    let asm = compile(
        "\
int id(int x) { return x; }
int main() {
    int a = 3;
    int b = id(4);
    return a + b;
}
",
    );

    let registers = saved_registers(&asm);
    assert!(!registers.is_empty());
    assert!(registers.iter().all(|reg| reg.starts_with('s')));

    // Cada registro `s` que se usa se preserva en el prólogo
    for reg in &registers {
        assert!(lines(&asm)
            .iter()
            .any(|line| line.starts_with(&format!("sw {}, ", reg))));
    }
}

#[test]
fn spills_when_registers_run_out() {
    let text = "\
int main() {
    int a = 1;
    int b = 2;
    int c = 3;
    int d = 4;
    return a + b + c + d;
}
";

    let narrow = compile_with(
        text,
        &Config {
            registers: 1,
            ..Config::default()
        },
    );

    let wide = compile(text);

    assert_eq!(saved_registers(&narrow).into_iter().collect::<Vec<_>>(), ["s0"]);
    assert!(saved_registers(&wide).len() > 1);

    // Solo los valores en spill se recargan en temporales
    let reloads = |asm: &str| {
        lines(asm)
            .iter()
            .filter(|line| line.starts_with("lw t") && line.ends_with("(sp)"))
            .count()
    };

    assert!(reloads(&narrow) > 0);
    assert_eq!(reloads(&wide), 0);
}

#[test]
fn local_arrays_live_in_the_frame() {
    let asm = compile(
        "\
int main() {
    int a[4] = {1, 2, 3, 4};
    return a[2];
}
",
    );

    assert!(lines(&asm)
        .iter()
        .any(|line| line.starts_with("addi t0, sp, ")));

    assert!(lines(&asm).iter().any(|line| line.starts_with("slli ")));
}

#[test]
fn annotations_describe_the_ir() {
    let config = Config {
        options: EmitOptions::ANNOTATE,
        ..Config::default()
    };

    let asm = compile_with("int main() { int a = 1; return a; }\n", &config);
    assert!(lines(&asm).iter().any(|line| line == "# %0 = alloca"));
    assert!(lines(&asm).iter().any(|line| line.starts_with("# ret ")));
}

#[test]
fn runs_converging_branches() {
    exits_with(
        "\
int f(int x) {
    if (x < 0) x = -x;
    else x = x * 2;
    return x + 1;
}
int main() {
    return f(-3) * 100 + f(5);
}
",
        411,
    );
}

#[test]
fn runs_recursion() {
    exits_with(
        "\
int fib(int n) {
    if (n < 2) return n;
    return fib(n - 1) + fib(n - 2);
}
int main() {
    return fib(10);
}
",
        55,
    );
}

#[test]
fn runs_calls_with_stack_arguments() {
    exits_with(
        "\
int mix(int a, int b, int c, int d, int e, int f, int g, int h, int i, int j) {
    return a - b + c - d + e - f + g - h + i * j;
}
int main() {
    int x = 5;
    return mix(1, 2, 3, 4, 5, 6, 7, 8, 9, 10) + x;
}
",
        91,
    );
}

#[test]
fn runs_values_across_calls() {
    exits_with(
        "\
int id(int x) { return x; }
int main() {
    int a = 3;
    int b = id(4);
    int c = id(a + b);
    return a * 100 + b * 10 + c;
}
",
        347,
    );
}

#[test]
fn runs_loops_under_register_pressure() {
    exits_with(
        "\
int main() {
    int a = 1;
    int b = 2;
    int c = 3;
    int d = 4;
    int e = 5;
    int f = 6;
    int i = 0;
    int s = 0;
    while (i < 4) {
        s = s + a * i + b - c + d * e - f;
        i = i + 1;
    }
    return s + a + b + c + d + e + f;
}
",
        79,
    );
}

#[test]
fn runs_short_circuit_and_nested_loops() {
    exits_with(
        "\
int g = 0;
int bump() {
    g = g + 1;
    return 1;
}
int main() {
    int i = 0;
    int n = 0;
    if (0 && bump()) g = 10;
    if (1 || bump()) g = g + 100;
    if (1 && bump()) g = g + 1000;
    while (i < 10) {
        i = i + 1;
        while (1) {
            n = n + 1;
            break;
        }
        if (i % 2) continue;
        n = n + 10;
    }
    return g + n;
}
",
        1101 + 60,
    );
}

#[test]
fn runs_array_parameters_and_large_frames() {
    exits_with(
        "\
int a[2][3] = {{1, 2, 3}, {4, 5, 6}};
int sum(int row[], int len) {
    int i = 0;
    int s = 0;
    while (i < len) {
        s = s + row[i];
        i = i + 1;
    }
    return s;
}
int main() {
    int big[600];
    int i = 0;
    while (i < 600) {
        big[i] = i;
        i = i + 1;
    }
    int b[2][2] = {{1}, {2, 3}};
    b[0][1] = sum(a[0], 3);
    return sum(a[1], 3) * 100 + b[0][1] * 10 + b[1][1] + b[1][0] - b[0][0] + big[599];
}
",
        1500 + 60 + 3 + 2 - 1 + 599,
    );
}
