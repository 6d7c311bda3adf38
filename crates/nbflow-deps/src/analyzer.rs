use std::collections::BTreeSet;
use tracing::{debug, warn};
use tree_sitter::{Node, Parser};

/// Symbols a cell defines and reads.
///
/// Scoping is whole-cell: a name bound anywhere in the cell (module level,
/// inside a function body or a class) counts as defined by the cell.
/// Parameters and comprehension variables only hide reads made inside the
/// function, lambda or comprehension that binds them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Analysis {
    pub defined: BTreeSet<String>,
    pub used: BTreeSet<String>,
}

impl Analysis {
    pub fn external_reads(&self) -> impl Iterator<Item = &String> {
        self.used.difference(&self.defined)
    }

    pub fn is_empty(&self) -> bool {
        self.defined.is_empty() && self.used.is_empty()
    }
}

/// Never fails: source that does not parse yields an empty analysis.
pub fn analyze(source: &str) -> Analysis {
    let mut parser = Parser::new();
    if let Err(err) = parser.set_language(&tree_sitter_python::LANGUAGE.into()) {
        warn!(event = "analyzer_language_error", error = %err);
        return Analysis::default();
    }
    let Some(tree) = parser.parse(source, None) else {
        debug!(event = "analyzer_parse_failed");
        return Analysis::default();
    };
    let root = tree.root_node();
    if root.has_error() {
        debug!(event = "analyzer_syntax_error", bytes = source.len());
        return Analysis::default();
    }

    let mut collector = Collector::new(source);
    collector.visit(root);
    collector.finish()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Scope {
    Cell,
    Local,
}

struct Collector<'s> {
    source: &'s str,
    defined: BTreeSet<String>,
    reads: BTreeSet<String>,
    frames: Vec<BTreeSet<String>>,
}

impl<'s> Collector<'s> {
    fn new(source: &'s str) -> Self {
        Self {
            source,
            defined: BTreeSet::new(),
            reads: BTreeSet::new(),
            frames: Vec::new(),
        }
    }

    fn finish(self) -> Analysis {
        Analysis {
            defined: self.defined,
            used: self.reads,
        }
    }

    fn is_local(&self, name: &str) -> bool {
        self.frames.iter().any(|frame| frame.contains(name))
    }

    fn text(&self, node: Node) -> Option<String> {
        node.utf8_text(self.source.as_bytes())
            .ok()
            .map(str::to_string)
    }

    fn read(&mut self, node: Node) {
        if let Some(name) = self.text(node) {
            if !self.is_local(&name) {
                self.reads.insert(name);
            }
        }
    }

    fn record(&mut self, node: Node, scope: Scope) {
        let Some(name) = self.text(node) else {
            return;
        };
        match scope {
            Scope::Cell => self.defined.insert(name),
            Scope::Local => match self.frames.last_mut() {
                Some(frame) => frame.insert(name),
                None => false,
            },
        };
    }

    fn visit_field(&mut self, node: Node, field: &str) {
        if let Some(child) = node.child_by_field_name(field) {
            self.visit(child);
        }
    }

    fn visit_fields(&mut self, node: Node, field: &str) {
        let mut cursor = node.walk();
        let children = node
            .children_by_field_name(field, &mut cursor)
            .collect::<Vec<_>>();
        for child in children {
            self.visit(child);
        }
    }

    fn visit_children(&mut self, node: Node) {
        let mut cursor = node.walk();
        let children = node.named_children(&mut cursor).collect::<Vec<_>>();
        for child in children {
            self.visit(child);
        }
    }

    fn visit(&mut self, node: Node) {
        match node.kind() {
            "identifier" => self.read(node),
            "assignment" => {
                if let Some(left) = node.child_by_field_name("left") {
                    self.bind(left, Scope::Cell);
                }
                self.visit_field(node, "type");
                self.visit_field(node, "right");
            }
            "augmented_assignment" => {
                if let Some(left) = node.child_by_field_name("left") {
                    if left.kind() == "identifier" {
                        self.read(left);
                        self.record(left, Scope::Cell);
                    } else {
                        self.visit(left);
                    }
                }
                self.visit_field(node, "right");
            }
            "named_expression" => {
                if let Some(name) = node.child_by_field_name("name") {
                    self.record(name, Scope::Cell);
                }
                self.visit_field(node, "value");
            }
            "function_definition" => {
                if let Some(name) = node.child_by_field_name("name") {
                    self.record(name, Scope::Cell);
                }
                let params = node.child_by_field_name("parameters");
                if let Some(params) = params {
                    self.visit_parameter_defaults(params);
                }
                self.visit_field(node, "return_type");
                self.frames.push(BTreeSet::new());
                if let Some(params) = params {
                    self.bind_parameters(params);
                }
                self.visit_field(node, "body");
                self.frames.pop();
            }
            "class_definition" => {
                if let Some(name) = node.child_by_field_name("name") {
                    self.record(name, Scope::Cell);
                }
                self.visit_field(node, "superclasses");
                self.visit_field(node, "body");
            }
            "lambda" => {
                let params = node.child_by_field_name("parameters");
                if let Some(params) = params {
                    self.visit_parameter_defaults(params);
                }
                self.frames.push(BTreeSet::new());
                if let Some(params) = params {
                    self.bind_parameters(params);
                }
                self.visit_field(node, "body");
                self.frames.pop();
            }
            "for_statement" => {
                if let Some(left) = node.child_by_field_name("left") {
                    self.bind(left, Scope::Cell);
                }
                self.visit_field(node, "right");
                self.visit_field(node, "body");
                self.visit_field(node, "alternative");
            }
            "list_comprehension" | "set_comprehension" | "dictionary_comprehension"
            | "generator_expression" => self.visit_comprehension(node),
            "import_statement" | "import_from_statement" => self.bind_imports(node),
            "as_pattern" => {
                let alias = node.child_by_field_name("alias");
                let mut cursor = node.walk();
                let children = node.named_children(&mut cursor).collect::<Vec<_>>();
                for child in children {
                    if Some(child.id()) == alias.map(|a| a.id()) {
                        self.bind(child, Scope::Cell);
                    } else {
                        self.visit(child);
                    }
                }
            }
            "except_clause" => {
                let alias = node.child_by_field_name("alias");
                let mut cursor = node.walk();
                let children = node.named_children(&mut cursor).collect::<Vec<_>>();
                for child in children {
                    if Some(child.id()) == alias.map(|a| a.id()) {
                        self.bind(child, Scope::Cell);
                    } else {
                        self.visit(child);
                    }
                }
            }
            "attribute" => self.visit_field(node, "object"),
            "keyword_argument" => self.visit_field(node, "value"),
            "global_statement" | "nonlocal_statement" | "comment" => {}
            _ => self.visit_children(node),
        }
    }

    fn bind(&mut self, node: Node, scope: Scope) {
        match node.kind() {
            "identifier" => self.record(node, scope),
            "pattern_list" | "tuple_pattern" | "list_pattern" | "tuple" | "list"
            | "expression_list" | "parenthesized_expression" | "list_splat_pattern"
            | "list_splat" | "dictionary_splat_pattern" => {
                let mut cursor = node.walk();
                let children = node.named_children(&mut cursor).collect::<Vec<_>>();
                for child in children {
                    self.bind(child, scope);
                }
            }
            "as_pattern_target" => {
                if node.named_child_count() == 0 {
                    self.record(node, scope);
                } else {
                    let mut cursor = node.walk();
                    let children = node.named_children(&mut cursor).collect::<Vec<_>>();
                    for child in children {
                        self.bind(child, scope);
                    }
                }
            }
            // `obj.attr = ..` and `obj[i] = ..` mutate rather than bind.
            _ => self.visit(node),
        }
    }

    // The first iterable is evaluated in the enclosing scope; everything
    // else sees the comprehension variables.
    fn visit_comprehension(&mut self, node: Node) {
        let mut cursor = node.walk();
        let children = node.named_children(&mut cursor).collect::<Vec<_>>();
        let clauses = children
            .iter()
            .copied()
            .filter(|child| child.kind() == "for_in_clause")
            .collect::<Vec<_>>();

        if let Some(first) = clauses.first() {
            self.visit_fields(*first, "right");
        }
        self.frames.push(BTreeSet::new());
        for clause in &clauses {
            if let Some(left) = clause.child_by_field_name("left") {
                self.bind(left, Scope::Local);
            }
        }
        for clause in clauses.iter().skip(1) {
            self.visit_fields(*clause, "right");
        }
        for child in children {
            if child.kind() != "for_in_clause" {
                self.visit(child);
            }
        }
        self.frames.pop();
    }

    fn visit_parameter_defaults(&mut self, params: Node) {
        let mut cursor = params.walk();
        let children = params.named_children(&mut cursor).collect::<Vec<_>>();
        for param in children {
            match param.kind() {
                "default_parameter" | "typed_default_parameter" => {
                    self.visit_field(param, "type");
                    self.visit_field(param, "value");
                }
                "typed_parameter" => self.visit_field(param, "type"),
                _ => {}
            }
        }
    }

    fn bind_parameters(&mut self, params: Node) {
        let mut cursor = params.walk();
        let children = params.named_children(&mut cursor).collect::<Vec<_>>();
        for param in children {
            match param.kind() {
                "identifier" | "list_splat_pattern" | "dictionary_splat_pattern"
                | "tuple_pattern" => self.bind(param, Scope::Local),
                "default_parameter" | "typed_default_parameter" => {
                    if let Some(name) = param.child_by_field_name("name") {
                        self.bind(name, Scope::Local);
                    }
                }
                "typed_parameter" => {
                    let type_id = param.child_by_field_name("type").map(|t| t.id());
                    let mut inner = param.walk();
                    let parts = param.named_children(&mut inner).collect::<Vec<_>>();
                    for part in parts {
                        if Some(part.id()) != type_id {
                            self.bind(part, Scope::Local);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn bind_imports(&mut self, node: Node) {
        let mut cursor = node.walk();
        let names = node
            .children_by_field_name("name", &mut cursor)
            .collect::<Vec<_>>();
        for name in names {
            match name.kind() {
                "aliased_import" => {
                    if let Some(alias) = name.child_by_field_name("alias") {
                        self.record(alias, Scope::Cell);
                    }
                }
                // `import a.b.c` binds `a`; `from m import x` binds `x`.
                "dotted_name" => {
                    if let Some(head) = name.named_child(0) {
                        self.record(head, Scope::Cell);
                    }
                }
                "identifier" => self.record(name, Scope::Cell),
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn assignment_defines_and_value_reads() {
        let analysis = analyze("total = price * quantity\n");
        assert_eq!(analysis.defined, names(&["total"]));
        assert_eq!(analysis.used, names(&["price", "quantity"]));
    }

    #[test]
    fn function_and_class_names_are_defined_at_any_depth() {
        let source = "\
class Model(Base):
    def fit(self, data):
        helper = scale(data)
        return helper

def train():
    return Model()
";
        let analysis = analyze(source);
        assert!(analysis.defined.contains("Model"));
        assert!(analysis.defined.contains("fit"));
        assert!(analysis.defined.contains("helper"));
        assert!(analysis.defined.contains("train"));
        assert!(analysis.used.contains("Base"));
        assert!(analysis.used.contains("scale"));
        assert!(!analysis.used.contains("self"));
        assert!(!analysis.used.contains("data"));
        assert_eq!(
            analysis.external_reads().cloned().collect::<BTreeSet<_>>(),
            names(&["Base", "scale"])
        );
    }

    #[test]
    fn imports_bind_their_visible_names() {
        let analysis = analyze("import numpy as np\nimport os.path\nfrom math import pi, tau as full_turn\n");
        assert_eq!(analysis.defined, names(&["full_turn", "np", "os", "pi"]));
        assert!(analysis.used.is_empty());
    }

    #[test]
    fn attribute_access_reads_only_the_object() {
        let analysis = analyze("arr = np.zeros(size)\nprint(arr.shape, sep=delim)\n");
        assert_eq!(analysis.defined, names(&["arr"]));
        assert_eq!(analysis.used, names(&["arr", "delim", "np", "print", "size"]));
        assert_eq!(
            analysis.external_reads().cloned().collect::<BTreeSet<_>>(),
            names(&["delim", "np", "print", "size"])
        );
    }

    #[test]
    fn comprehension_and_lambda_variables_stay_local() {
        let analysis = analyze("squares = [n * n for n in values]\nscale = lambda v, k=factor: v * k\n");
        assert_eq!(analysis.defined, names(&["scale", "squares"]));
        assert_eq!(analysis.used, names(&["factor", "values"]));
    }

    #[test]
    fn parameter_names_do_not_hide_module_level_reads() {
        let analysis = analyze("def summarize(data):\n    return len(data)\nprint(summarize(data))\n");
        assert_eq!(analysis.defined, names(&["summarize"]));
        assert_eq!(analysis.used, names(&["data", "len", "print", "summarize"]));

        let analysis = analyze("print(x)\nsquares = [x * x for x in range(3)]\n");
        assert_eq!(analysis.used, names(&["print", "range", "x"]));

        let analysis = analyze("scale = lambda v: v * 2\nresult = scale(v)\n");
        assert!(analysis.used.contains("v"));
    }

    #[test]
    fn comprehension_iterable_and_defaults_read_the_enclosing_scope() {
        let analysis = analyze("pairs = [(a, b) for a in a for b in a]\n");
        assert_eq!(analysis.used, names(&["a"]));

        let analysis = analyze("def pad(text, width=width):\n    return text.ljust(width)\n");
        assert_eq!(analysis.used, names(&["width"]));

        let analysis = analyze("lookup = {k: v for k, v in items if v}\n");
        assert_eq!(analysis.used, names(&["items"]));
    }

    #[test]
    fn tuple_targets_loops_and_augmented_assignment() {
        let analysis = analyze("a, (b, c) = load()\nfor row in rows:\n    count += row\n");
        assert!(analysis.defined.is_superset(&names(&["a", "b", "c", "row", "count"])));
        assert!(analysis.used.contains("count"));
        assert!(analysis.used.contains("rows"));
        assert!(analysis.used.contains("load"));
    }

    #[test]
    fn self_referencing_update_has_no_external_read() {
        let analysis = analyze("x = x + 1\n");
        assert_eq!(analysis.defined, names(&["x"]));
        assert_eq!(analysis.external_reads().count(), 0);
    }

    #[test]
    fn syntax_error_yields_empty_sets() {
        let analysis = analyze("def broken(:\n    return y\n");
        assert!(analysis.is_empty());
        assert!(analyze("x = = 1").is_empty());
    }

    #[test]
    fn empty_and_comment_only_cells_are_empty() {
        assert!(analyze("").is_empty());
        assert!(analyze("#| test\n# nothing here\n").is_empty());
    }
}
