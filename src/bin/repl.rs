use embedlisp::reader;
use embedlisp::{Context, Value};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::panic;
use std::process;

fn main() {
    let result = panic::catch_unwind(|| {
        run_repl();
    });

    if let Err(panic_info) = result {
        eprintln!("The REPL encountered an unexpected error and must exit.");

        if let Some(msg) = panic_info.downcast_ref::<&str>() {
            eprintln!("Error: {msg}");
        } else if let Some(msg) = panic_info.downcast_ref::<String>() {
            eprintln!("Error: {msg}");
        } else {
            eprintln!("Error: Unknown panic occurred");
        }

        process::exit(1);
    }
}

fn run_repl() {
    println!("embedlisp - bytecode-compiled embeddable Lisp");
    println!("Enter S-expressions like: (+ 1 2)");
    println!("Type :help for more commands, or Ctrl+C to exit.");
    println!();

    let mut rl = DefaultEditor::new().expect("Could not initialize REPL");
    let ctx = Context::new();

    loop {
        match rl.readline("embedlisp> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let _ = rl.add_history_entry(line);

                match line {
                    ":help" => {
                        print_help();
                        continue;
                    }
                    ":primitives" => {
                        print_primitives(&ctx);
                        continue;
                    }
                    ":quit" | ":exit" => {
                        println!("Goodbye!");
                        break;
                    }
                    _ => {}
                }

                // :expand shows the macro expansion instead of evaluating
                if let Some(form_text) = line.strip_prefix(":expand ") {
                    match reader::parse(form_text, ctx.package()) {
                        Ok(form) => match ctx.macro_expand_full(&form) {
                            Ok(expanded) => println!("{expanded}"),
                            Err(e) => println!("Error: {e}"),
                        },
                        Err(e) => println!("Error: {e}"),
                    }
                    continue;
                }

                match ctx.eval_source(line) {
                    Ok(Value::Nil) => {}
                    Ok(result) => println!("{result}"),
                    Err(e) => println!("Error: {e}"),
                }
            }

            Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => {
                println!("Goodbye!");
                break;
            }
            Err(err) => {
                println!("Error: {err:?}");
                break;
            }
        }
    }
}

fn print_help() {
    println!("embedlisp REPL:");
    println!("  :help          - Show this help message");
    println!("  :primitives    - List the registered primitive functions");
    println!("  :expand FORM   - Show the full macro expansion of FORM");
    println!("  :quit / :exit  - Exit the interpreter");
    println!();
    println!("Special forms:");
    println!("  (quote x) 'x (begin ...) (set! name value)");
    println!("  (if test then [else]) (if* test else)");
    println!("  (lambda (args...) body...) with dotted rest: (a . rest)");
    println!("  (defmacro name (args...) body...)");
    println!();
    println!("Examples:");
    println!("  (+ 1 2 3)");
    println!("  ((lambda (a b) (if (< a b) a b)) 7 4)");
    println!("  (defmacro unless (c . body) (list 'if c nil (cons 'begin body)))");
    println!();
}

fn print_primitives(ctx: &Context) {
    let names = ctx.primitives().names();
    println!("Primitive functions ({} total):", names.len());
    let mut col = 0;
    for name in names {
        print!("  {name:<10}");
        col += 1;
        if col % 6 == 0 {
            println!();
        }
    }
    if col % 6 != 0 {
        println!();
    }
}
