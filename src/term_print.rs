use anyhow::Result;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use proctrace_core::config::ModuleConfig;

use crate::replay::ReplayStats;

pub struct TermPrinted;

pub trait TermPrintable {
    fn term_print(&self) -> Result<TermPrinted>;
}

impl TermPrintable for ReplayStats {
    fn term_print(&self) -> Result<TermPrinted> {
        let mut table = table();

        table.set_header(vec![
            Cell::new("COUNTER").add_attribute(Attribute::Bold),
            Cell::new("VALUE").add_attribute(Attribute::Bold),
        ]);

        let sizes = [
            ("messages", self.messages),
            ("skipped lines", self.skipped_lines),
            ("process cache size", self.cache_size as u64),
            ("pid index size", self.pid_index_size as u64),
            ("dns cache size", self.dns_size as u64),
        ];
        for (name, value) in sizes {
            table.add_row(vec![
                Cell::new(name).fg(Color::Cyan).add_attribute(Attribute::Bold),
                Cell::new(value),
            ]);
        }

        for ((original, processed), count) in &self.processed {
            table.add_row(vec![
                Cell::new(format!("{} -> {}", original.name(), processed.name()))
                    .fg(Color::Blue)
                    .add_attribute(Attribute::Bold),
                Cell::new(count),
            ]);
        }

        for (kind, count) in self.errors.iter().filter(|(_, count)| *count > 0) {
            table.add_row(vec![
                Cell::new(kind.name())
                    .fg(Color::Red)
                    .add_attribute(Attribute::Bold),
                Cell::new(count),
            ]);
        }

        println!("{table}");
        Ok(TermPrinted)
    }
}

impl TermPrintable for Vec<(String, ModuleConfig)> {
    fn term_print(&self) -> Result<TermPrinted> {
        let mut table = table();

        table.set_header(vec![
            Cell::new("SECTION").add_attribute(Attribute::Bold),
            Cell::new("KEY").add_attribute(Attribute::Bold),
            Cell::new("VALUE").add_attribute(Attribute::Bold),
        ]);

        for (section, config) in self {
            for (key, value) in config.iter() {
                table.add_row(vec![
                    Cell::new(section)
                        .fg(Color::Blue)
                        .add_attribute(Attribute::Bold),
                    Cell::new(key)
                        .fg(Color::Cyan)
                        .add_attribute(Attribute::Bold),
                    Cell::new(value),
                ]);
            }
        }

        println!("{table}");
        Ok(TermPrinted)
    }
}

fn table() -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);

    table
}
