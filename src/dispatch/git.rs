use std::borrow::Cow;

/// Where repositories are cloned from and which branch counts as reviewed
#[derive(Clone, Debug)]
pub struct GitSettings {
    /// Clone URL, `{org}` and `{repo}` are substituted
    pub remote_template: String,
    /// Browsable URL of a repository, `{org}` and `{repo}` are substituted
    pub web_template: String,
    pub org: String,
    pub default_branch: String,
}

impl Default for GitSettings {
    fn default() -> Self {
        GitSettings {
            remote_template: "https://github.com/{org}/{repo}.git".to_string(),
            web_template: "https://github.com/{org}/{repo}".to_string(),
            org: "populationgenomics".to_string(),
            default_branch: "main".to_string(),
        }
    }
}

impl GitSettings {
    pub fn remote(&self, repo: &str) -> String {
        self.remote_template.replace("{org}", &self.org).replace("{repo}", repo)
    }

    /// Link to the script being run at this commit
    pub fn script_url(&self, repo: &str, commit: &str, cwd: Option<&str>, script: &str) -> String {
        let base = self.web_template.replace("{org}", &self.org).replace("{repo}", repo);
        let path = [cwd.unwrap_or(""), script]
            .iter()
            .map(|part| part.trim_matches('/'))
            .filter(|part| !part.is_empty() && *part != ".")
            .collect::<Vec<_>>()
            .join("/");
        format!("{base}/tree/{commit}/{path}")
    }
}

/// Shell-quote one token
pub fn quote(token: &str) -> String {
    shell_escape::unix::escape(Cow::Borrowed(token)).into_owned()
}

/// Commands that clone `repo` and check out `commit`, leaving the shell in the repository root
///
/// With `require_reviewed` the commit has to be an ancestor of the default branch, otherwise the
/// job exits non-zero before anything from the repository runs. The check runs inside the job,
/// the server never has a working copy.
pub fn checkout_commands(repo: &str, commit: &str, require_reviewed: bool, settings: &GitSettings) -> Vec<String> {
    let mut commands = vec![
        format!("git clone --recurse-submodules {} {}", quote(&settings.remote(repo)), quote(repo)),
        format!("cd {}", quote(repo)),
    ];
    if require_reviewed {
        commands.push(format!("git checkout {}", quote(&settings.default_branch)));
        commands.push(format!(
            "git merge-base --is-ancestor {} HEAD || {{ echo {}; exit 1; }}",
            quote(commit),
            quote(&format!("error: commit not merged into {} branch", settings.default_branch)),
        ));
    }
    commands.push(format!("git checkout {}", quote(commit)));
    commands.push("git submodule update".to_string());
    commands
}
