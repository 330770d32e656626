use std::fs;
use std::path::Path;

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.first().map(String::as_str) {
        Some("man") => generate_man_pages(),
        Some(other) => {
            eprintln!("unknown xtask command: {other}");
            eprintln!("available commands: man");
            std::process::exit(1);
        }
        None => {
            eprintln!("usage: cargo xtask <command>");
            eprintln!("available commands: man");
            std::process::exit(1);
        }
    }
}

fn generate_man_pages() {
    let out_dir = Path::new("man");
    fs::create_dir_all(out_dir).expect("failed to create man/ directory");

    let cmd = bdg::command();
    let mut count = 0;

    render_man_page(&cmd, "bdg", out_dir);
    count += 1;
    count += generate_subcommand_pages(&cmd, "bdg", out_dir);

    println!("Generated {count} man pages in {}", out_dir.display());
}

fn generate_subcommand_pages(cmd: &clap::Command, prefix: &str, out_dir: &Path) -> usize {
    let mut count = 0;
    for sub in cmd.get_subcommands() {
        if sub.get_name() == "help" || sub.is_hide_set() {
            continue;
        }
        let page_name = format!("{prefix}-{}", sub.get_name());
        render_man_page(sub, &page_name, out_dir);
        count += 1;
        count += generate_subcommand_pages(sub, &page_name, out_dir);
    }
    count
}

fn render_man_page(cmd: &clap::Command, name: &str, out_dir: &Path) {
    let man = clap_mangen::Man::new(cmd.clone().name(name.to_owned()));
    let mut buffer = Vec::new();
    man.render(&mut buffer).expect("failed to render man page");
    let path = out_dir.join(format!("{name}.1"));
    fs::write(&path, buffer).expect("failed to write man page");
}
