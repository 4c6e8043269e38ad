//! Coverage report documents and their XML rendering.

use std::fmt::Write;

const COBERTURA_DTD: &str = "http://cobertura.sourceforge.net/xml/coverage-04.dtd";
pub const COBERTURA_VERSION: &str = "2.0.3";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineHits {
    pub number: usize,
    pub hits: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoberturaMethod {
    pub name: String,
    pub signature: String,
    pub lines: Vec<LineHits>,
}

/// One pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoberturaClass {
    pub name: String,
    pub filename: String,
    pub methods: Vec<CoberturaMethod>,
    pub lines: Vec<LineHits>,
}

impl CoberturaClass {
    pub fn lines_valid(&self) -> usize {
        self.lines.len()
    }

    pub fn lines_covered(&self) -> usize {
        self.lines.iter().filter(|l| l.hits > 0).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoberturaPackage {
    pub name: String,
    pub classes: Vec<CoberturaClass>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoberturaCoverage {
    pub sources: Vec<String>,
    pub packages: Vec<CoberturaPackage>,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
}

fn rate(covered: usize, valid: usize) -> f64 {
    if valid == 0 {
        0.0
    } else {
        covered as f64 / valid as f64
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn write_lines(out: &mut String, indent: &str, lines: &[LineHits]) {
    let _ = writeln!(out, "{}<lines>", indent);
    for line in lines {
        let _ = writeln!(
            out,
            "{}  <line number=\"{}\" hits=\"{}\"></line>",
            indent, line.number, line.hits
        );
    }
    let _ = writeln!(out, "{}</lines>", indent);
}

impl CoberturaCoverage {
    pub fn lines_valid(&self) -> usize {
        self.packages
            .iter()
            .flat_map(|p| &p.classes)
            .map(CoberturaClass::lines_valid)
            .sum()
    }

    pub fn lines_covered(&self) -> usize {
        self.packages
            .iter()
            .flat_map(|p| &p.classes)
            .map(CoberturaClass::lines_covered)
            .sum()
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
        let _ = writeln!(out, "<!DOCTYPE coverage SYSTEM \"{}\">", COBERTURA_DTD);
        let (valid, covered) = (self.lines_valid(), self.lines_covered());
        let _ = writeln!(
            out,
            "<coverage line-rate=\"{}\" branch-rate=\"0\" version=\"{}\" timestamp=\"{}\" lines-covered=\"{}\" lines-valid=\"{}\" branches-covered=\"0\" branches-valid=\"0\" complexity=\"0\">",
            rate(covered, valid),
            COBERTURA_VERSION,
            self.timestamp,
            covered,
            valid
        );
        let _ = writeln!(out, "  <sources>");
        for source in &self.sources {
            let _ = writeln!(out, "    <source>{}</source>", escape(source));
        }
        let _ = writeln!(out, "  </sources>");
        let _ = writeln!(out, "  <packages>");
        for package in &self.packages {
            let classes = &package.classes;
            let valid: usize = classes.iter().map(CoberturaClass::lines_valid).sum();
            let covered: usize = classes.iter().map(CoberturaClass::lines_covered).sum();
            let _ = writeln!(
                out,
                "    <package name=\"{}\" line-rate=\"{}\" branch-rate=\"0\" complexity=\"0\">",
                escape(&package.name),
                rate(covered, valid)
            );
            let _ = writeln!(out, "      <classes>");
            for class in classes {
                let _ = writeln!(
                    out,
                    "        <class name=\"{}\" filename=\"{}\" line-rate=\"{}\" branch-rate=\"0\" complexity=\"0\">",
                    escape(&class.name),
                    escape(&class.filename),
                    rate(class.lines_covered(), class.lines_valid())
                );
                let _ = writeln!(out, "          <methods>");
                for method in &class.methods {
                    let covered = method.lines.iter().filter(|l| l.hits > 0).count();
                    let _ = writeln!(
                        out,
                        "            <method name=\"{}\" signature=\"{}\" line-rate=\"{}\" branch-rate=\"0\" complexity=\"0\">",
                        escape(&method.name),
                        escape(&method.signature),
                        rate(covered, method.lines.len())
                    );
                    write_lines(&mut out, "              ", &method.lines);
                    let _ = writeln!(out, "            </method>");
                }
                let _ = writeln!(out, "          </methods>");
                write_lines(&mut out, "          ", &class.lines);
                let _ = writeln!(out, "        </class>");
            }
            let _ = writeln!(out, "      </classes>");
            let _ = writeln!(out, "    </package>");
        }
        let _ = writeln!(out, "  </packages>");
        let _ = writeln!(out, "</coverage>");
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineToCover {
    pub line_number: usize,
    pub covered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericFile {
    pub path: String,
    pub lines: Vec<LineToCover>,
}

/// Generic test coverage document, as read by SonarQube.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericCoverage {
    pub test_type: String,
    pub files: Vec<GenericFile>,
}

impl GenericCoverage {
    pub fn lines_valid(&self) -> usize {
        self.files.iter().map(|f| f.lines.len()).sum()
    }

    pub fn lines_covered(&self) -> usize {
        self.files
            .iter()
            .flat_map(|f| &f.lines)
            .filter(|l| l.covered)
            .count()
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
        let _ = writeln!(out, "<coverage version=\"1\">");
        let _ = writeln!(out, "  <!-- {} test coverage -->", self.test_type.replace("--", "-"));
        for file in &self.files {
            let _ = writeln!(out, "  <file path=\"{}\">", escape(&file.path));
            for line in &file.lines {
                let _ = writeln!(
                    out,
                    "    <lineToCover lineNumber=\"{}\" covered=\"{}\"></lineToCover>",
                    line.line_number, line.covered
                );
            }
            let _ = writeln!(out, "  </file>");
        }
        let _ = writeln!(out, "</coverage>");
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverageReport {
    Cobertura(CoberturaCoverage),
    Generic(GenericCoverage),
}

impl CoverageReport {
    pub fn lines_valid(&self) -> usize {
        match self {
            CoverageReport::Cobertura(c) => c.lines_valid(),
            CoverageReport::Generic(g) => g.lines_valid(),
        }
    }

    pub fn lines_covered(&self) -> usize {
        match self {
            CoverageReport::Cobertura(c) => c.lines_covered(),
            CoverageReport::Generic(g) => g.lines_covered(),
        }
    }

    pub fn to_xml(&self) -> String {
        match self {
            CoverageReport::Cobertura(c) => c.to_xml(),
            CoverageReport::Generic(g) => g.to_xml(),
        }
    }
}
