mod binder;
mod client;
mod credentials;
mod discovery;
mod error;
mod token_store;

use anyhow::{Result, anyhow};
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::env;
use std::io::{Read, Write};
use std::path::PathBuf;

use crate::binder::{BODY_FLAG_PREFIX, BodyInput, FlagValues};
use crate::client::{ApiResponse, DEFAULT_ENDPOINT, GoogleClient};
use crate::credentials::{Credential, MetaCredentials, OAuthConfig};
use crate::discovery::{Api, Method};
use crate::error::GapiError;
use crate::token_store::{DEFAULT_TOKENS_FILE, TokenStore};

const PROGRAM: &str = "gapi";

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let matches = build_cli().get_matches();
    setup_logging(matches.get_flag("debug"))?;
    let config = load_config(&matches)?;

    match matches.subcommand() {
        None => {
            simple_help(&mut std::io::stdout().lock())?;
            Ok(0)
        }
        Some(("help", sub)) => handle_help(&config, sub),
        Some(("list", _)) => handle_list(&config),
        Some(("auth.start", sub)) => handle_auth_start(&config, sub),
        Some(("auth.finish", sub)) => handle_auth_finish(&config, sub),
        Some(("auth.print", sub)) => handle_auth_print(&config, sub),
        Some(("auth.revoke", sub)) => handle_auth_revoke(&config, sub),
        Some((identifier, sub)) => {
            let args: Vec<String> = sub
                .get_many::<String>("")
                .map(|values| values.cloned().collect())
                .unwrap_or_default();
            handle_call(&config, identifier, &args)
        }
    }
}

struct Config {
    endpoint: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    tokens_file: PathBuf,
    timeout: Option<u64>,
}

fn load_config(matches: &ArgMatches) -> Result<Config> {
    let endpoint = matches
        .get_one::<String>("endpoint")
        .cloned()
        .or_else(|| env::var("GAPI_ENDPOINT").ok())
        .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

    let client_id = matches
        .get_one::<String>("client_id")
        .cloned()
        .or_else(|| env::var("GAPI_CLIENT_ID").ok());

    let client_secret = matches
        .get_one::<String>("client_secret")
        .cloned()
        .or_else(|| env::var("GAPI_CLIENT_SECRET").ok());

    let tokens_file = matches
        .get_one::<String>("tokens_file")
        .cloned()
        .or_else(|| env::var("GAPI_TOKENS_FILE").ok())
        .unwrap_or_else(|| DEFAULT_TOKENS_FILE.to_string());

    let timeout = matches.get_one::<u64>("timeout").copied();

    Ok(Config {
        endpoint,
        client_id,
        client_secret,
        tokens_file: PathBuf::from(tokens_file),
        timeout,
    })
}

impl Config {
    fn client(&self) -> Result<GoogleClient> {
        GoogleClient::new(self.endpoint.clone(), self.timeout)
    }

    fn oauth(&self) -> Result<OAuthConfig> {
        let client_id = self
            .client_id
            .clone()
            .ok_or_else(|| anyhow!("GAPI_CLIENT_ID missing (or pass --client-id)"))?;
        Ok(OAuthConfig::installed(
            client_id,
            self.client_secret.clone().unwrap_or_default(),
        ))
    }
}

fn setup_logging(debug: bool) -> Result<()> {
    if debug {
        env_logger::Builder::from_env("RUST_LOG")
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::Builder::from_env("RUST_LOG")
            .filter_level(log::LevelFilter::Warn)
            .init();
    }
    Ok(())
}

fn build_cli() -> Command {
    let api_method = |cmd: Command| {
        cmd.arg(Arg::new("api").required(true).help("API name, optionally name:version"))
            .arg(Arg::new("method").required(true).help("Method, e.g. events.list"))
    };

    Command::new(PROGRAM)
        .about("Makes requests to Google APIs described by the Discovery service")
        .version(env!("CARGO_PKG_VERSION"))
        .disable_help_subcommand(true)
        .allow_external_subcommands(true)
        .external_subcommand_value_parser(clap::value_parser!(String))
        .override_usage(format!(
            "{PROGRAM} [OPTIONS] <api>[:<version>] <method> [--param=value ...]\n       {PROGRAM} [OPTIONS] <COMMAND>"
        ))
        .arg(
            Arg::new("endpoint")
                .long("endpoint")
                .global(true)
                .value_name("URL")
                .help("API root, e.g. https://my-app-id.appspot.com/_ah/api/ (env: GAPI_ENDPOINT)"),
        )
        .arg(
            Arg::new("client_id")
                .long("client-id")
                .global(true)
                .value_name("ID")
                .help("OAuth client id for auth.* commands (env: GAPI_CLIENT_ID)"),
        )
        .arg(
            Arg::new("client_secret")
                .long("client-secret")
                .global(true)
                .value_name("SECRET")
                .help("OAuth client secret for auth.finish (env: GAPI_CLIENT_SECRET)"),
        )
        .arg(
            Arg::new("tokens_file")
                .long("tokens-file")
                .global(true)
                .value_name("FILE")
                .help("Token store location (env: GAPI_TOKENS_FILE)"),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .global(true)
                .value_name("SECONDS")
                .value_parser(clap::value_parser!(u64))
                .help("HTTP timeout in seconds (default: none)"),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Enable debug logging"),
        )
        .subcommand(
            Command::new("help")
                .about("Describe an API or one of its methods")
                .arg(Arg::new("api"))
                .arg(Arg::new("method")),
        )
        .subcommand(Command::new("list").about("List APIs in the Discovery directory"))
        .subcommand(api_method(
            Command::new("auth.start").about("Print the URL that authorizes a method's scopes"),
        ))
        .subcommand(
            Command::new("auth.finish")
                .about("Exchange an authorization code and store the token")
                .arg(Arg::new("code").required(true)),
        )
        .subcommand(api_method(
            Command::new("auth.print").about("Print the stored access token for a method"),
        ))
        .subcommand(api_method(
            Command::new("auth.revoke").about("Revoke and forget the stored token for a method"),
        ))
}

/// Flags for one method, generated from its Discovery description.
fn build_method_cli(api: &Api, method: &Method, name: &str) -> Command {
    let mut cmd = Command::new(format!("{PROGRAM} {} {}", api.name, name))
        .about(method.description.clone())
        .no_binary_name(true)
        .arg(
            Arg::new("meta.pem")
                .long("meta.pem")
                .value_name("FILE")
                .help("Location of the service account .pem file"),
        )
        .arg(
            Arg::new("meta.secrets")
                .long("meta.secrets")
                .value_name("FILE")
                .help("Location of client_secrets.json"),
        )
        .arg(
            Arg::new("meta.inFile")
                .long("meta.inFile")
                .value_name("FILE")
                .help("File to pass as request body"),
        )
        .arg(
            Arg::new("meta.in")
                .long("meta.in")
                .action(ArgAction::SetTrue)
                .help("Use stdin as the request body"),
        )
        .arg(
            Arg::new("meta.token")
                .long("meta.token")
                .value_name("TOKEN")
                .help("OAuth 2.0 access token to use"),
        );

    for (param_name, param) in api.merged_parameters(method) {
        cmd = cmd.arg(
            Arg::new(param_name.to_string())
                .long(param_name.to_string())
                .value_name(param.kind.to_string())
                .allow_hyphen_values(true)
                .help(param.description.clone()),
        );
    }

    if let Some(schema) = api.request_schema(method) {
        for (prop_name, prop) in &schema.properties {
            let flag = format!("{BODY_FLAG_PREFIX}{prop_name}");
            cmd = cmd.arg(
                Arg::new(flag.clone())
                    .long(flag)
                    .value_name(prop.kind.to_string())
                    .allow_hyphen_values(true)
                    .help(format!("Request body: {}", prop.description)),
            );
        }
    }

    cmd
}

/// Everything the user supplied for one method call.
#[derive(Debug, Default)]
struct CallRequest {
    values: FlagValues,
    body: BodyInput,
    credentials: MetaCredentials,
}

impl CallRequest {
    fn from_matches(api: &Api, method: &Method, matches: &ArgMatches) -> Self {
        let mut ids: Vec<String> = api
            .merged_parameters(method)
            .keys()
            .map(|k| k.to_string())
            .collect();
        if let Some(schema) = api.request_schema(method) {
            ids.extend(
                schema
                    .properties
                    .keys()
                    .map(|k| format!("{BODY_FLAG_PREFIX}{k}")),
            );
        }

        let values = ids
            .into_iter()
            .filter_map(|id| {
                let value = matches.get_one::<String>(&id).cloned()?;
                Some((id, value))
            })
            .collect();

        let non_empty = |id: &str| {
            matches
                .get_one::<String>(id)
                .filter(|v| !v.is_empty())
                .cloned()
        };

        Self {
            values,
            body: BodyInput {
                in_file: non_empty("meta.inFile").map(PathBuf::from),
                from_stdin: matches.get_flag("meta.in"),
            },
            credentials: MetaCredentials {
                pem: non_empty("meta.pem").map(PathBuf::from),
                secrets: non_empty("meta.secrets").map(PathBuf::from),
                token: non_empty("meta.token"),
            },
        }
    }
}

#[derive(Debug)]
enum CallOutcome {
    /// No credential for the method's scopes; holds the command that fixes it.
    NeedsAuthorization { command: String },
    Completed(ApiResponse),
}

fn auth_start_command(api: &Api, method: &Method) -> String {
    format!("{PROGRAM} auth.start {} {}", api.name, api.relative_name(method))
}

fn invoke(
    client: &GoogleClient,
    api: &Api,
    method: &Method,
    request: &CallRequest,
    store: &TokenStore,
    stdin: &mut impl Read,
) -> Result<CallOutcome> {
    let url = binder::bind_url(api, method, &request.values)?;
    let body = binder::build_body(api, method, &request.values, &request.body, stdin)?;

    let credential = credentials::resolve(client, method, &request.credentials, store)?;
    if let Credential::Unauthorized { scope } = &credential {
        log::debug!("no token stored for scope {:?}", scope);
        return Ok(CallOutcome::NeedsAuthorization {
            command: auth_start_command(api, method),
        });
    }

    let resp = client.execute(&method.http_method, &url, credential.bearer(), body)?;
    Ok(CallOutcome::Completed(resp))
}

fn handle_call(config: &Config, identifier: &str, args: &[String]) -> Result<i32> {
    let client = config.client()?;
    let api = discovery::load_api(&client, identifier)?;

    let Some((method_name, rest)) = args.split_first() else {
        return Err(anyhow!(
            "must specify a method to call; run \"{PROGRAM} help {identifier}\" to see a list of available methods"
        ));
    };
    let method = discovery::find_method(method_name, &api)?;
    let matches = build_method_cli(&api, method, method_name).get_matches_from(rest);
    let request = CallRequest::from_matches(&api, method, &matches);
    let store = TokenStore::load(&config.tokens_file);

    let outcome = invoke(
        &client,
        &api,
        method,
        &request,
        &store,
        &mut std::io::stdin().lock(),
    )?;
    report_outcome(
        method,
        outcome,
        &mut std::io::stdout().lock(),
        &mut std::io::stderr().lock(),
    )
}

/// Writes a call's result and returns the process exit code: 2xx bodies go
/// to `out`, anything else to `err` with exit code 1.
fn report_outcome(
    method: &Method,
    outcome: CallOutcome,
    out: &mut impl Write,
    err: &mut impl Write,
) -> Result<i32> {
    match outcome {
        CallOutcome::NeedsAuthorization { command } => {
            write_line(out, "This method requires access to protected resources")?;
            write_line(out, "Run the following command to get an auth token:")?;
            write_line(out, &command)?;
            Ok(0)
        }
        CallOutcome::Completed(resp) if resp.is_success() => {
            write_bytes(out, &resp.body)?;
            Ok(0)
        }
        CallOutcome::Completed(resp) => {
            log::warn!("{} {} returned {}", method.http_method, method.id, resp.status);
            write_bytes(err, &resp.body)?;
            Ok(1)
        }
    }
}

fn simple_help(out: &mut impl Write) -> Result<()> {
    write_line(out, "Makes requests to Google APIs")?;
    write_line(out, "Usage:")?;
    write_line(out, &format!("  {PROGRAM} <api> <method> --param=foo"))?;
    write_line(out, &format!("  {PROGRAM} help [api [method]]"))?;
    write_line(out, &format!("  {PROGRAM} list"))?;
    write_line(
        out,
        &format!("  {PROGRAM} auth.start|auth.print|auth.revoke <api> <method>"),
    )?;
    write_line(out, &format!("  {PROGRAM} auth.finish <code>"))?;
    Ok(())
}

fn handle_help(config: &Config, matches: &ArgMatches) -> Result<i32> {
    let Some(identifier) = matches.get_one::<String>("api") else {
        simple_help(&mut std::io::stdout().lock())?;
        return Ok(0);
    };
    let client = config.client()?;
    let method_name = matches.get_one::<String>("method").map(String::as_str);
    print_help(&client, identifier, method_name, &mut std::io::stdout().lock())?;
    Ok(0)
}

fn print_help(
    client: &GoogleClient,
    identifier: &str,
    method_name: Option<&str>,
    out: &mut impl Write,
) -> Result<()> {
    let api = discovery::load_api(client, identifier)?;

    let Some(method_name) = method_name else {
        write_line(out, &format!("{} ({}:{})", api.title, api.name, api.version))?;
        write_line(out, &api.description)?;
        write_line(out, &format!("More information: {}", api.documentation_link))?;
        write_line(out, "Methods:")?;
        for method in api.all_methods() {
            let line = format!("- {}: {}", api.relative_name(method), method.description);
            write_line(out, &line)?;
        }
        return Ok(());
    };

    let method = discovery::find_method(method_name, &api)?;
    write_line(out, &format!("{} {}", method_name, method.description))?;
    let http = format!("  http: {} {}{}", method.http_method, api.base_url, method.path);
    write_line(out, &http)?;
    if let Some(scope) = credentials::scope_string(method) {
        write_line(out, &format!("  scopes: {scope}"))?;
    }
    write_line(out, "Parameters:")?;
    for (name, param) in api.merged_parameters(method) {
        let mut line = format!("  --{} ({}) - {}", name, param.kind, param.description);
        if param.required {
            line.push_str(" [required]");
        }
        if let Some(default) = &param.default {
            line.push_str(&format!(" [default: {default}]"));
        }
        write_line(out, &line)?;
    }
    if let Some(schema) = api.request_schema(method) {
        for (name, prop) in &schema.properties {
            let line = format!(
                "  --{BODY_FLAG_PREFIX}{name} ({}) - {}",
                prop.kind, prop.description
            );
            write_line(out, &line)?;
        }
    }
    Ok(())
}

fn handle_list(config: &Config) -> Result<i32> {
    let client = config.client()?;
    print_list(&client, &mut std::io::stdout().lock())?;
    Ok(0)
}

fn print_list(client: &GoogleClient, out: &mut impl Write) -> Result<()> {
    let items = discovery::list_directory(client)?;
    write_line(out, "Available APIs:")?;
    for item in items {
        let line = format!("- {} {} - {}", item.name, item.version, item.description);
        write_line(out, &line)?;
    }
    Ok(())
}

/// Loads the API and method named by an `auth.*` subcommand.
fn load_target(client: &GoogleClient, matches: &ArgMatches) -> Result<(Api, String)> {
    let identifier = matches
        .get_one::<String>("api")
        .ok_or_else(|| anyhow!("api required"))?;
    let method_name = matches
        .get_one::<String>("method")
        .ok_or_else(|| anyhow!("method required"))?;
    let api = discovery::load_api(client, identifier)?;
    Ok((api, method_name.clone()))
}

fn handle_auth_start(config: &Config, matches: &ArgMatches) -> Result<i32> {
    let oauth = config.oauth()?;
    let client = config.client()?;
    let (api, method_name) = load_target(&client, matches)?;
    let method = discovery::find_method(&method_name, &api)?;
    let scope = credentials::scope_string(method)
        .ok_or_else(|| GapiError::NoAuthRequired(method_name.clone()))?;

    write_stdout_line("Open a browser and visit the following URL:")?;
    write_stdout_line(&oauth.auth_code_url(&scope))?;
    write_stdout_line("Then run the following command with the resulting auth code:")?;
    write_stdout_line(&format!("{PROGRAM} auth.finish <code>"))?;
    Ok(0)
}

fn handle_auth_finish(config: &Config, matches: &ArgMatches) -> Result<i32> {
    let oauth = config.oauth()?;
    if oauth.client_secret.is_empty() {
        return Err(anyhow!("GAPI_CLIENT_SECRET missing (or pass --client-secret)"));
    }
    let code = matches
        .get_one::<String>("code")
        .ok_or_else(|| anyhow!("code required"))?;
    let client = config.client()?;

    let mut store = TokenStore::load(&config.tokens_file);
    let scope = credentials::finish(&client, &oauth, &mut store, code)?;
    store.save(&config.tokens_file)?;
    log::debug!("stored token for {:?} in {}", scope, config.tokens_file.display());
    write_stdout_line("Token saved")?;
    Ok(0)
}

fn handle_auth_print(config: &Config, matches: &ArgMatches) -> Result<i32> {
    let client = config.client()?;
    let (api, method_name) = load_target(&client, matches)?;
    let method = discovery::find_method(&method_name, &api)?;
    let Some(scope) = credentials::scope_string(method) else {
        write_stdout_line("Method doesn't require auth")?;
        return Ok(0);
    };

    let store = TokenStore::load(&config.tokens_file);
    match store.get(&scope) {
        Some(token) => write_stdout_line(&token.access_token)?,
        None => {
            write_stdout_line("No token found. Run the following command to store a token:")?;
            write_stdout_line(&auth_start_command(&api, method))?;
        }
    }
    Ok(0)
}

fn handle_auth_revoke(config: &Config, matches: &ArgMatches) -> Result<i32> {
    let oauth = OAuthConfig::installed(
        config.client_id.clone().unwrap_or_default(),
        config.client_secret.clone().unwrap_or_default(),
    );
    let client = config.client()?;
    let (api, method_name) = load_target(&client, matches)?;
    let method = discovery::find_method(&method_name, &api)?;
    let Some(scope) = credentials::scope_string(method) else {
        write_stdout_line("Method doesn't require auth")?;
        return Ok(0);
    };

    let mut store = TokenStore::load(&config.tokens_file);
    if credentials::revoke(&client, &oauth, &mut store, &scope)? {
        store.save(&config.tokens_file)?;
        write_stdout_line("Token revoked")?;
    } else {
        write_stdout_line("No token found for this method")?;
    }
    Ok(0)
}

fn write_stdout_line(value: &str) -> Result<()> {
    write_line(&mut std::io::stdout().lock(), value)
}

fn write_line(out: &mut impl Write, value: &str) -> Result<()> {
    write_bytes(out, value.as_bytes())?;
    write_bytes(out, b"\n")
}

fn write_bytes(out: &mut impl Write, value: &[u8]) -> Result<()> {
    if let Err(err) = out.write_all(value).and_then(|_| out.flush()) {
        if err.kind() == std::io::ErrorKind::BrokenPipe {
            std::process::exit(0);
        }
        return Err(err.into());
    }
    Ok(())
}
