// List known pipelines

use color_eyre::Result;
use pipe_core::{list_pipelines, Paths};

use crate::output;

pub fn execute() -> Result<()> {
    let paths = Paths::resolve();
    let infos = list_pipelines(&paths)?;

    if infos.is_empty() {
        output::dim("no pipelines found; create one with: pipe init <name>");
        return Ok(());
    }

    let width = infos.iter().map(|i| i.name.len()).max().unwrap_or(0);
    for info in infos {
        if info.description.is_empty() {
            println!("{}", info.name);
        } else {
            println!("{:<width$}  \x1b[2m{}\x1b[0m", info.name, info.description);
        }
    }
    Ok(())
}
