use log::warn;

use ffs_parser::FfsParser;

pub fn show_messages(p: &FfsParser) {
    let t = p.tree();
    if p.messages().is_empty() {
        println!("No problems found");
        return;
    }
    println!("Messages:");
    for (node, text) in p.messages() {
        match node {
            Some(id) => {
                let n = t.get(*id);
                let o = match n.absolute_offset {
                    Some(o) => format!("{o:08x}"),
                    None => "--------".to_string(),
                };
                println!("  {o} {} {}: {text}", n.kind, n.name);
            }
            None => println!("  {text}"),
        }
    }
}

pub fn show(p: &FfsParser, verbose: bool) {
    let t = p.tree();
    if verbose {
        println!("{t:#}");
    } else {
        println!("{t}");
    }
    match p.last_vtf() {
        Some(vtf) => {
            let n = t.get(vtf);
            match n.address {
                Some(a) => println!("Volume top file {} at {a:08x}", n.name),
                None => println!("Volume top file {}", n.name),
            }
        }
        None => warn!("No volume top file found, memory addresses unknown"),
    }
    println!();
    show_messages(p);
}
