//! Reading NEXUS/Newick tree files and writing summary outputs.
//!
//! # Reading
//! Sources are NEXUS files (`TAXA` and `TREES` blocks, optional `TRANSLATE`
//! table) or plain Newick files with one `;`-terminated tree per statement.
//! Paths ending in `.gz` are decompressed transparently and `-` reads
//! standard input.
//!
//! Square-bracket comments are stripped before the Newick string is handed
//! to `phylotree`, except for the tree-level `[&R]`, `[&U]` and `[&W ...]`
//! statements, which set rooting and weight:
//! ```text
//! tree STATE_100 = [&R] [&W 1/2] ((A:1,B:1):[&rate=0.3]1,C:2);
//! ```
//!
//! # Writing
//! Output paths ending in `.gz` are gzip-compressed; `-` writes to standard
//! output.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use itertools::Itertools;
use phylotree::tree::Tree as PhyloTree;
use tracing::{debug, warn};

use crate::distribution::SplitDistribution;
use crate::error::{Result, SumTreesError};
use crate::splits::{quote_label, split_as_newick_string};
use crate::taxon::TaxonNamespace;
use crate::topology::TreeProbability;
use crate::tree::{NodeId, Rooting, RootingInterpretation, Tree};
use crate::worker::TreeSource;

/// Reads the whole source into memory, decompressing `.gz` files.
pub fn read_source(path: &Path) -> Result<String> {
    let mut content = String::new();
    if path.as_os_str() == "-" {
        io::stdin().read_to_string(&mut content)?;
    } else if path.to_string_lossy().ends_with(".gz") {
        GzDecoder::new(File::open(path)?).read_to_string(&mut content)?;
    } else {
        content = fs::read_to_string(path)?;
    }
    Ok(content)
}

/// Builds the taxon namespace of a source: its `TAXLABELS`, else its
/// `TRANSLATE` table, else the leaves of its first tree in order of
/// appearance. The namespace is returned unlocked.
pub fn discover_taxa(path: &Path) -> Result<TaxonNamespace> {
    let content = read_source(path)?;
    let document = parse_document(&content);
    let mut namespace = TaxonNamespace::new();
    if !document.taxlabels.is_empty() {
        for label in &document.taxlabels {
            namespace.register(label)?;
        }
    } else if !document.translate_order.is_empty() {
        for key in &document.translate_order {
            if let Some(label) = document.translate.get(key) {
                namespace.register(label)?;
            }
        }
    } else {
        let statement = document
            .trees
            .first()
            .ok_or_else(|| SumTreesError::NoTrees(path.to_path_buf()))?;
        let (newick, quoted) = prepare_newick(&statement.body);
        let phylo = PhyloTree::from_newick(&newick).map_err(|e| parse_error(path, 0, e))?;
        let root = phylo.get_root().map_err(|e| parse_error(path, 0, e))?;
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let node = phylo.get(&id).map_err(|e| parse_error(path, 0, e))?;
            if node.children.is_empty() {
                let label = resolve_name(node.name.as_deref(), &quoted, &document.translate);
                namespace.register(&label)?;
            }
            stack.extend(node.children.iter().rev());
        }
    }
    debug!(path = %path.display(), taxa = namespace.len(), "discovered taxa");
    Ok(namespace)
}

/// Tree reader for NEXUS and Newick sources.
#[derive(Clone, Copy, Debug, Default)]
pub struct NexusReader {
    pub rooting: RootingInterpretation,
    /// Keep `[&W ...]` weights on the trees read.
    pub store_tree_weights: bool,
}

impl NexusReader {
    /// Reads every tree of `path` eagerly.
    pub fn read_trees(&self, path: &Path, namespace: &Arc<TaxonNamespace>) -> Result<Vec<Tree>> {
        self.trees(path, namespace)?.collect()
    }
}

impl TreeSource for NexusReader {
    fn trees<'a>(
        &'a self,
        source: &Path,
        namespace: &Arc<TaxonNamespace>,
    ) -> Result<Box<dyn Iterator<Item = Result<Tree>> + 'a>> {
        let content = read_source(source)?;
        let NexusDocument { translate, trees, .. } = parse_document(&content);
        let path = source.to_path_buf();
        let namespace = Arc::clone(namespace);
        Ok(Box::new(trees.into_iter().enumerate().map(move |(idx, statement)| {
            self.build_tree(&path, idx, statement, &translate, &namespace)
        })))
    }
}

impl NexusReader {
    fn build_tree(
        &self,
        path: &Path,
        index: usize,
        statement: TreeStatement,
        translate: &HashMap<String, String>,
        namespace: &TaxonNamespace,
    ) -> Result<Tree> {
        let (newick, quoted) = prepare_newick(&statement.body);
        let phylo = PhyloTree::from_newick(&newick).map_err(|e| parse_error(path, index, e))?;
        let mut tree = Tree::new(self.rooting.apply(statement.rooting));
        tree.label = statement.name;
        if self.store_tree_weights {
            tree.weight = statement.weight;
        }

        let root = phylo.get_root().map_err(|e| parse_error(path, index, e))?;
        let mut stack: Vec<(usize, NodeId)> = vec![(root, tree.root())];
        while let Some((phylo_id, id)) = stack.pop() {
            let node = phylo.get(&phylo_id).map_err(|e| parse_error(path, index, e))?;
            let name = node
                .name
                .as_deref()
                .map(|n| resolve_name(Some(n), &quoted, translate));
            let target = tree.node_mut(id);
            target.edge.length = node.parent_edge;
            if node.children.is_empty() {
                let label = name.unwrap_or_default();
                target.taxon = Some(namespace.require(&label)?);
            } else {
                target.label = name;
                let mut children = Vec::with_capacity(node.children.len());
                for _ in &node.children {
                    children.push(tree.add_child(id, Default::default()));
                }
                // pushed in reverse so the first child is expanded first
                for (&child, arena) in node.children.iter().zip(children).rev() {
                    stack.push((child, arena));
                }
            }
        }
        Ok(tree)
    }
}

fn parse_error(path: &Path, index: usize, err: impl std::fmt::Display) -> SumTreesError {
    SumTreesError::Parse {
        path: path.to_path_buf(),
        index,
        message: err.to_string(),
    }
}

#[derive(Debug, Default)]
struct NexusDocument {
    taxlabels: Vec<String>,
    translate: HashMap<String, String>,
    translate_order: Vec<String>,
    trees: Vec<TreeStatement>,
}

#[derive(Debug, Default, PartialEq)]
struct TreeStatement {
    name: Option<String>,
    rooting: Option<Rooting>,
    weight: Option<f64>,
    /// Newick text, comments included, without the trailing `;`.
    body: String,
}

fn parse_document(content: &str) -> NexusDocument {
    let mut document = NexusDocument::default();
    let is_nexus = content.trim_start().to_ascii_uppercase().starts_with("#NEXUS");
    let commands = split_commands(content);
    if !is_nexus {
        document.trees = commands
            .iter()
            .filter(|c| !strip_comments(c).trim().is_empty())
            .map(|c| tree_statement(None, c))
            .collect();
        return document;
    }

    for command in &commands {
        let text = strip_comments(command);
        let text = text.trim().trim_start_matches("#NEXUS").trim_start_matches("#nexus").trim();
        let keyword = text
            .split(|c: char| c.is_whitespace() || c == '*' || c == '=')
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();
        match keyword.as_str() {
            "TAXLABELS" => {
                document.taxlabels.extend(tokenize(&text["TAXLABELS".len()..]));
            }
            "TRANSLATE" => {
                let tokens = tokenize(&text["TRANSLATE".len()..]);
                for (key, label) in tokens.into_iter().tuples() {
                    document.translate_order.push(key.clone());
                    document.translate.insert(key, label);
                }
            }
            "TREE" => {
                if let Some(statement) = nexus_tree_command(command) {
                    document.trees.push(statement);
                }
            }
            _ => {}
        }
    }
    document
}

/// Parses `TREE [*] name = [&R] (...)` keeping the comments of the body.
fn nexus_tree_command(command: &str) -> Option<TreeStatement> {
    let eq = find_outside_quotes(command, '=')?;
    let header = strip_comments(&command[..eq]);
    let name = header.trim_start()[4..]
        .trim_matches(|c: char| c.is_whitespace() || c == '*');
    // tree names keep their underscores
    let name = if name.starts_with('\'') {
        tokenize(name).into_iter().next()
    } else {
        Some(name.to_string()).filter(|n| !n.is_empty())
    };
    Some(tree_statement(name, &command[eq + 1..]))
}

fn tree_statement(name: Option<String>, body: &str) -> TreeStatement {
    let mut statement = TreeStatement {
        name,
        body: body.trim().to_string(),
        ..TreeStatement::default()
    };
    let prefix_end = body.find('(').unwrap_or(body.len());
    for comment in comments(&body[..prefix_end]) {
        let comment = comment.trim();
        let Some(directive) = comment.strip_prefix('&') else {
            continue;
        };
        match directive.trim().to_ascii_uppercase().as_str() {
            "R" => statement.rooting = Some(Rooting::Rooted),
            "U" => statement.rooting = Some(Rooting::Unrooted),
            d if d.starts_with('W') => statement.weight = parse_weight(directive.trim()[1..].trim()),
            _ => {}
        }
    }
    statement
}

/// `1/2` or `0.5`.
fn parse_weight(text: &str) -> Option<f64> {
    match text.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            (den != 0.0).then(|| num / den)
        }
        None => text.parse().ok(),
    }
}

/// Splits on `;` outside quotes and comments.
fn split_commands(content: &str) -> Vec<String> {
    let mut commands = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut depth = 0usize;
    for ch in content.chars() {
        match ch {
            '\'' if depth == 0 => in_quote = !in_quote,
            '[' if !in_quote => depth += 1,
            ']' if !in_quote && depth > 0 => depth -= 1,
            ';' if !in_quote && depth == 0 => {
                commands.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }
    if !current.trim().is_empty() {
        commands.push(current);
    }
    commands
}

/// Removes `[...]` comments outside quotes.
fn strip_comments(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut in_quote = false;
    let mut depth = 0usize;
    for ch in text.chars() {
        match ch {
            '\'' if depth == 0 => in_quote = !in_quote,
            '[' if !in_quote => {
                depth += 1;
                continue;
            }
            ']' if !in_quote && depth > 0 => {
                depth -= 1;
                continue;
            }
            _ => {}
        }
        if depth == 0 {
            result.push(ch);
        }
    }
    result
}

/// Contents of the top-level comments of `text`.
fn comments(text: &str) -> Vec<String> {
    let mut found = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut depth = 0usize;
    for ch in text.chars() {
        match ch {
            '\'' if depth == 0 => in_quote = !in_quote,
            '[' if !in_quote => {
                depth += 1;
                if depth == 1 {
                    continue;
                }
            }
            ']' if !in_quote && depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    found.push(std::mem::take(&mut current));
                    continue;
                }
            }
            _ => {}
        }
        if depth > 0 {
            current.push(ch);
        }
    }
    found
}

fn find_outside_quotes(text: &str, target: char) -> Option<usize> {
    let mut in_quote = false;
    let mut depth = 0usize;
    for (idx, ch) in text.char_indices() {
        match ch {
            '\'' if depth == 0 => in_quote = !in_quote,
            '[' if !in_quote => depth += 1,
            ']' if !in_quote && depth > 0 => depth -= 1,
            c if c == target && !in_quote && depth == 0 => return Some(idx),
            _ => {}
        }
    }
    None
}

/// Splits NEXUS words on whitespace and commas. Quoted words keep their
/// spaces (`''` is a literal quote); underscores in unquoted words become
/// spaces.
fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&ch) = chars.peek() {
        if ch.is_whitespace() || ch == ',' {
            chars.next();
        } else if ch == '\'' {
            chars.next();
            let mut word = String::new();
            while let Some(c) = chars.next() {
                if c == '\'' {
                    if chars.peek() == Some(&'\'') {
                        chars.next();
                        word.push('\'');
                    } else {
                        break;
                    }
                } else {
                    word.push(c);
                }
            }
            tokens.push(word);
        } else {
            let mut word = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() || c == ',' {
                    break;
                }
                word.push(if c == '_' { ' ' } else { c });
                chars.next();
            }
            tokens.push(word);
        }
    }
    tokens
}

/// Prepares a tree body for `phylotree`: comments and whitespace removed,
/// quoted labels replaced by placeholders, `;` appended. Returns the
/// unquoted labels indexed by placeholder number.
fn prepare_newick(body: &str) -> (String, Vec<String>) {
    let stripped = strip_comments(body);
    let mut newick = String::with_capacity(stripped.len() + 1);
    let mut quoted = Vec::new();
    let mut chars = stripped.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\'' {
            let mut label = String::new();
            while let Some(c) = chars.next() {
                if c == '\'' {
                    if chars.peek() == Some(&'\'') {
                        chars.next();
                        label.push('\'');
                    } else {
                        break;
                    }
                } else {
                    label.push(c);
                }
            }
            newick.push_str(&format!("__q{}", quoted.len()));
            quoted.push(label);
        } else if !ch.is_whitespace() && ch != ';' {
            newick.push(ch);
        }
    }
    newick.push(';');
    (newick, quoted)
}

/// Undoes quoting placeholders and applies the translate table.
fn resolve_name(name: Option<&str>, quoted: &[String], translate: &HashMap<String, String>) -> String {
    let raw = name.unwrap_or_default();
    let label = raw
        .strip_prefix("__q")
        .and_then(|n| n.parse::<usize>().ok())
        .and_then(|n| quoted.get(n).cloned())
        .unwrap_or_else(|| raw.replace('_', " "));
    translate.get(&label).cloned().unwrap_or(label)
}

/// What to include when rendering a tree as Newick.
#[derive(Clone, Copy, Debug)]
pub struct NewickOptions {
    pub edge_lengths: bool,
    pub annotations: bool,
    pub rooting: bool,
}

impl Default for NewickOptions {
    fn default() -> Self {
        NewickOptions {
            edge_lengths: true,
            annotations: true,
            rooting: true,
        }
    }
}

/// Renders `tree` as a `;`-terminated Newick string.
///
/// Leaves are written as quoted taxon labels; internal nodes with a label
/// (e.g. support) carry it after the closing parenthesis, followed by any
/// `[&key=value]` annotations and `:length`.
pub fn newick_string(tree: &Tree, namespace: &TaxonNamespace, options: NewickOptions) -> String {
    let mut out = String::new();
    if options.rooting {
        match tree.rooting {
            Rooting::Rooted => out.push_str("[&R] "),
            Rooting::Unrooted => out.push_str("[&U] "),
            Rooting::Unknown => {}
        }
    }
    write_subtree(&mut out, tree, tree.root(), namespace, options);
    out.push(';');
    out
}

fn write_subtree(out: &mut String, tree: &Tree, id: NodeId, namespace: &TaxonNamespace, options: NewickOptions) {
    let node = tree.node(id);
    if node.is_leaf() {
        let label = node
            .taxon
            .and_then(|t| namespace.label(t))
            .or(node.label.as_deref())
            .unwrap_or("");
        out.push_str(&quote_label(label));
    } else {
        out.push('(');
        for (pos, &child) in node.children.iter().enumerate() {
            if pos > 0 {
                out.push(',');
            }
            write_subtree(out, tree, child, namespace, options);
        }
        out.push(')');
        if let Some(label) = &node.label {
            out.push_str(&quote_label(label));
        }
    }
    if options.annotations && !node.edge.annotations.is_empty() {
        out.push_str(&format_annotations(&node.edge.annotations));
    }
    if options.edge_lengths {
        if let Some(length) = node.edge.length {
            out.push_str(&format!(":{length}"));
        }
    }
}

fn format_annotations(annotations: &[(String, String)]) -> String {
    let body = annotations.iter().map(|(k, v)| format!("{k}={v}")).join(",");
    format!("[&{body}]")
}

/// An open output destination. [`Output::finish`] must be called once
/// writing is done: it flushes buffers and writes the gzip trailer.
pub enum Output {
    Stdout(BufWriter<io::Stdout>),
    File(BufWriter<File>),
    Gzip(BufWriter<GzEncoder<File>>),
}

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Output::Stdout(w) => w.write(buf),
            Output::File(w) => w.write(buf),
            Output::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Output::Stdout(w) => w.flush(),
            Output::File(w) => w.flush(),
            Output::Gzip(w) => w.flush(),
        }
    }
}

impl Output {
    pub fn finish(self) -> Result<()> {
        match self {
            Output::Stdout(mut w) => w.flush()?,
            Output::File(mut w) => w.flush()?,
            Output::Gzip(w) => {
                let encoder = w.into_inner().map_err(|e| e.into_error())?;
                encoder.finish()?;
            }
        }
        Ok(())
    }
}

/// Opens an output destination: `-` is standard output, `.gz` paths are
/// compressed. Existing files are refused unless `replace` is set.
pub fn create_output(path: &Path, replace: bool) -> Result<Output> {
    if path.as_os_str() == "-" {
        return Ok(Output::Stdout(BufWriter::new(io::stdout())));
    }
    if path.exists() && !replace {
        return Err(SumTreesError::OutputExists(path.to_path_buf()));
    }
    let file = File::create(path)?;
    if path.to_string_lossy().ends_with(".gz") {
        Ok(Output::Gzip(BufWriter::new(GzEncoder::new(file, Compression::default()))))
    } else {
        Ok(Output::File(BufWriter::new(file)))
    }
}

/// Writes `trees` as a NEXUS document: the given file comments, a TAXA
/// block unless `taxa_block` is false, and a TREES block.
pub fn write_nexus(
    out: &mut dyn Write,
    trees: &[Tree],
    namespace: &TaxonNamespace,
    comments: &[String],
    taxa_block: bool,
    options: NewickOptions,
) -> Result<()> {
    writeln!(out, "#NEXUS")?;
    writeln!(out)?;
    if !comments.is_empty() {
        writeln!(out, "[")?;
        for line in comments {
            // NEXUS comments cannot nest brackets
            writeln!(out, "{}", line.replace('[', "(").replace(']', ")"))?;
        }
        writeln!(out, "]")?;
        writeln!(out)?;
    }
    if taxa_block {
        writeln!(out, "BEGIN TAXA;")?;
        writeln!(out, "    DIMENSIONS NTAX={};", namespace.len())?;
        writeln!(out, "    TAXLABELS")?;
        for label in namespace.labels() {
            writeln!(out, "        {}", quote_label(label))?;
        }
        writeln!(out, "  ;")?;
        writeln!(out, "END;")?;
        writeln!(out)?;
    }
    writeln!(out, "BEGIN TREES;")?;
    for (idx, tree) in trees.iter().enumerate() {
        let name = tree
            .label
            .as_deref()
            .map(quote_label)
            .unwrap_or_else(|| (idx + 1).to_string());
        let tree_annotations = if tree.annotations.is_empty() {
            String::new()
        } else {
            format!("{} ", format_annotations(&tree.annotations))
        };
        writeln!(
            out,
            "    TREE {name} = {tree_annotations}{}",
            newick_string(tree, namespace, options)
        )?;
    }
    writeln!(out, "END;")?;
    out.flush()?;
    Ok(())
}

/// Writes `trees` one Newick string per line.
pub fn write_newick(out: &mut dyn Write, trees: &[Tree], namespace: &TaxonNamespace, options: NewickOptions) -> Result<()> {
    for tree in trees {
        writeln!(out, "{}", newick_string(tree, namespace, options))?;
    }
    out.flush()?;
    Ok(())
}

/// Writes the ranked topologies as a NEXUS trees file annotated with
/// `count`, `probability` and `cumulative_probability`.
pub fn write_tree_probabilities(
    out: &mut dyn Write,
    probabilities: &[TreeProbability],
    namespace: &TaxonNamespace,
    taxa_block: bool,
) -> Result<()> {
    let trees: Vec<Tree> = probabilities
        .iter()
        .map(|p| {
            let mut tree = p.tree.clone();
            tree.annotations = vec![
                ("count".to_string(), p.count.to_string()),
                ("probability".to_string(), p.probability.to_string()),
                ("cumulative_probability".to_string(), p.cumulative_probability.to_string()),
            ];
            tree
        })
        .collect();
    let options = NewickOptions {
        edge_lengths: false,
        annotations: false,
        rooting: true,
    };
    write_nexus(out, &trees, namespace, &[], taxa_block, options)
}

/// One row per split: its leaf-set rendering followed by every edge length
/// observed for it, tab-separated.
pub fn write_split_edge_lengths(out: &mut dyn Write, distribution: &SplitDistribution) -> Result<()> {
    let namespace = distribution.namespace();
    for (split, stats) in distribution.splits() {
        write!(out, "{}", split_as_newick_string(split, namespace))?;
        for length in &stats.edge_lengths {
            write!(out, "\t{length}")?;
        }
        writeln!(out)?;
    }
    out.flush()?;
    Ok(())
}

/// Expands and checks support file paths; missing files are an error unless
/// `ignore_missing`, in which case they are dropped.
pub fn resolve_sources(paths: &[PathBuf], ignore_missing: bool) -> Result<Vec<PathBuf>> {
    let mut sources = Vec::with_capacity(paths.len());
    for path in paths {
        if path.as_os_str() == "-" || path.exists() {
            sources.push(path.clone());
        } else if ignore_missing {
            warn!(path = %path.display(), "support file not found: skipping");
        } else {
            return Err(SumTreesError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("support file not found: {}", path.display()),
            )));
        }
    }
    Ok(sources)
}
