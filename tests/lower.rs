use std::collections::HashMap;

use sysyc::{
    ir::{BinOp, CmpOp, Function, Label, Local, Module, Op, Value},
    lex::Lexer,
    parse, source,
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

fn function<'a>(module: &'a Module, name: &str) -> &'a Function {
    module
        .functions
        .iter()
        .find(|function| &*function.signature.name == name)
        .expect("no such function")
}

/// Etiquetas de los bloques con este nombre, en orden de creación.
fn labels(function: &Function, name: &str) -> Vec<Label> {
    (0..function.blocks.len() as u32)
        .map(Label)
        .filter(|&label| function.block(label).name == name)
        .collect()
}

fn jumps_to(function: &Function, target: Label) -> usize {
    function
        .iter()
        .flat_map(|(_, block)| &block.instructions)
        .filter(|instruction| matches!(instruction.op, Op::Jump(label) if label == target))
        .count()
}

/// Intérprete de IR con memoria direccionada por palabras.
struct Machine<'m> {
    module: &'m Module,
    memory: Vec<i32>,
    globals: HashMap<String, i32>,
    fuel: u32,
}

impl<'m> Machine<'m> {
    fn new(module: &'m Module) -> Self {
        let mut memory = Vec::new();
        let mut globals = HashMap::new();

        for global in &module.globals {
            globals.insert(global.name.clone(), memory.len() as i32);
            memory.extend_from_slice(&global.init);
        }

        Machine {
            module,
            memory,
            globals,
            fuel: 100_000,
        }
    }

    fn run(module: &Module) -> i32 {
        Machine::new(module).call("main", &[])
    }

    fn eval(&self, value: &Value, locals: &[i32], arguments: &[i32]) -> i32 {
        match value {
            Value::Const(constant) => *constant,
            Value::Global(global) => self.globals[&global.name],
            Value::Argument(index) => arguments[*index as usize],
            Value::Local(Local(local)) => locals[*local as usize],
        }
    }

    fn call(&mut self, name: &str, arguments: &[i32]) -> i32 {
        let module = self.module;
        let function = function(module, name);

        let mut locals = vec![0; function.locals as usize];
        let mut previous: Option<Label> = None;
        let mut current = function.layout[0];

        loop {
            let mut next = None;

            for instruction in &function.block(current).instructions {
                self.fuel = self.fuel.checked_sub(1).expect("out of fuel");

                let eval = |machine: &Self, locals: &[i32], value: &Value| {
                    machine.eval(value, locals, arguments)
                };

                let result = match &instruction.op {
                    Op::Alloca => {
                        self.memory.push(0);
                        self.memory.len() as i32 - 1
                    }

                    Op::ArrayAlloca(words) => {
                        let base = self.memory.len();
                        self.memory.resize(base + *words as usize, 0);
                        base as i32
                    }

                    Op::Load(address) => self.memory[eval(self, &locals, address) as usize],

                    Op::Store { value, target } => {
                        let value = eval(self, &locals, value);
                        let target = eval(self, &locals, target);
                        self.memory[target as usize] = value;
                        0
                    }

                    Op::Binary(op, lhs, rhs) => {
                        let lhs = eval(self, &locals, lhs);
                        let rhs = eval(self, &locals, rhs);

                        match op {
                            BinOp::Add => lhs.wrapping_add(rhs),
                            BinOp::Sub => lhs.wrapping_sub(rhs),
                            BinOp::Mul => lhs.wrapping_mul(rhs),
                            BinOp::Div => lhs.wrapping_div(rhs),
                            BinOp::Rem => lhs.wrapping_rem(rhs),
                        }
                    }

                    Op::Compare(op, lhs, rhs) => {
                        let lhs = eval(self, &locals, lhs);
                        let rhs = eval(self, &locals, rhs);

                        let result = match op {
                            CmpOp::Eq => lhs == rhs,
                            CmpOp::Ne => lhs != rhs,
                            CmpOp::Lt => lhs < rhs,
                            CmpOp::Le => lhs <= rhs,
                            CmpOp::Gt => lhs > rhs,
                            CmpOp::Ge => lhs >= rhs,
                        };

                        result as i32
                    }

                    Op::ZExt(value) => eval(self, &locals, value),

                    Op::Phi(incoming) => {
                        let (value, _) = incoming
                            .iter()
                            .find(|(_, from)| Some(*from) == previous)
                            .expect("phi without matching predecessor");

                        eval(self, &locals, value)
                    }

                    Op::ElementPtr { base, offset } => {
                        eval(self, &locals, base) + eval(self, &locals, offset)
                    }

                    Op::Call { target, arguments } => {
                        let values: Vec<i32> = arguments
                            .iter()
                            .map(|argument| eval(self, &locals, argument))
                            .collect();

                        self.call(&target.name, &values)
                    }

                    Op::Jump(target) => {
                        next = Some(*target);
                        break;
                    }

                    Op::Branch {
                        condition,
                        then,
                        otherwise,
                    } => {
                        next = Some(if eval(self, &locals, condition) != 0 {
                            *then
                        } else {
                            *otherwise
                        });

                        break;
                    }

                    Op::Ret(value) => return eval(self, &locals, value),
                    Op::RetVoid => return 0,
                };

                if let Some(Local(output)) = instruction.output {
                    locals[output as usize] = result;
                }
            }

            previous = Some(current);
            current = next.expect("block without terminator");
        }
    }
}

#[test]
fn converges_after_both_branches() {
    let text = "\
int f(int x) {
    if (x < 0) x = -x;
    else x = x * 2;
    return x + 1;
}
int main() {
    return f(-3) * 100 + f(5);
}
";

    let module = lower(text);
    let f = function(&module, "f");

    let join = labels(f, "if_end");
    assert_eq!(join.len(), 1);
    assert_eq!(jumps_to(f, join[0]), 2);

    assert_eq!(Machine::run(&module), 4 * 100 + 11);
}

#[test]
fn short_circuit_builds_phi() {
    let text = "\
int main() {
    int a = 1;
    int b = 0;
    if (a && b) return 1;
    return 0;
}
";

    let module = lower(text);
    let main = function(&module, "main");

    let rhs = labels(main, "cond_rhs");
    let phi = labels(main, "cond_phi");
    assert_eq!((rhs.len(), phi.len()), (1, 1));

    // El lado izquierdo salta a evaluar el derecho o directo al phi
    let branches: Vec<(Label, Label)> = main
        .iter()
        .flat_map(|(_, block)| &block.instructions)
        .filter_map(|instruction| match instruction.op {
            Op::Branch { then, otherwise, .. } => Some((then, otherwise)),
            _ => None,
        })
        .collect();

    assert!(branches.contains(&(rhs[0], phi[0])));

    let merge = &main.block(phi[0]).instructions[0];
    match &merge.op {
        Op::Phi([(_, left), (_, right)]) => {
            assert_ne!(left, right);
            assert_eq!(*right, rhs[0]);
        }

        op => panic!("expected phi, found {:?}", op),
    }

    assert!(matches!(
        main.block(phi[0]).instructions[1].op,
        Op::ZExt(Value::Local(_))
    ));
}

#[test]
fn short_circuit_skips_right_operand() {
    let text = "\
int g = 0;
int bump() {
    g = g + 1;
    return 1;
}
int main() {
    if (0 && bump()) g = 10;
    if (1 || bump()) g = g + 100;
    if (1 && bump()) g = g + 1000;
    return g;
}
";

    assert_eq!(Machine::run(&lower(text)), 1101);
}

#[test]
fn break_and_continue_target_innermost_loop() {
    let text = "\
int main() {
    int i = 0;
    int n = 0;
    while (i < 10) {
        i = i + 1;
        while (1) {
            n = n + 1;
            break;
        }
        if (i % 2) continue;
        n = n + 10;
    }
    return n;
}
";

    let module = lower(text);
    let main = function(&module, "main");

    let conds = labels(main, "while_cond");
    let nexts = labels(main, "while_next");
    assert_eq!((conds.len(), nexts.len()), (2, 2));

    let (outer_cond, inner_next) = (conds[0], nexts[1]);

    // Entrada, `continue` y regreso del ciclo externo
    assert_eq!(jumps_to(main, outer_cond), 3);

    // Solo el `break` sale del ciclo interno por salto directo
    assert_eq!(jumps_to(main, inner_next), 1);

    assert_eq!(Machine::run(&module), 10 + 5 * 10);
}

#[test]
fn arrays_and_partial_subscripts() {
    let text = "\
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
    int b[2][2] = {{1}, {2, 3}};
    b[0][1] = sum(a[0], 3);
    return sum(a[1], 3) * 100 + b[0][1] * 10 + b[1][1] + b[1][0] - b[0][0] - 1;
}
";

    assert_eq!(Machine::run(&lower(text)), 15 * 100 + 6 * 10 + 3);
}

#[test]
fn void_functions_fall_through() {
    let text = "\
int g;
void set(int v) {
    if (v > 0) {
        g = v;
        return;
    }
    g = -1;
}
int main() {
    set(0);
    set(7);
    return g;
}
";

    let module = lower(text);
    let set = function(&module, "set");
    assert!(set.iter().any(|(_, block)| matches!(
        block.terminator().map(|terminator| &terminator.op),
        Some(Op::RetVoid)
    )));

    assert_eq!(Machine::run(&module), 7);
}

#[test]
fn ir_text() {
    let module = lower("int g = 3;\nint main() { return g; }\n");
    let text = module.to_string();

    assert!(text.starts_with("@g = global [3]\n"));
    assert!(text.contains("define int @main() {"));
    assert!(text.contains("load @g"));
}
