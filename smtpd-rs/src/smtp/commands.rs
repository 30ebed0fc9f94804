use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum SmtpCommand {
    Helo(String),
    Ehlo(String),
    MailFrom(String, Vec<String>),
    RcptTo(String),
    Data,
    Rset,
    Quit,
    Noop,
    Starttls,
    /// Mechanism and optional initial response
    Auth(String, Option<String>),
    Unknown(String),
}

/// A recognised command with unusable arguments (reply 501), or an empty line (reply 500)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Empty command")]
    Empty,

    #[error("{0}")]
    Syntax(&'static str),
}

impl SmtpCommand {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ParseError::Empty);
        }

        let (command, args) = match line.split_once(char::is_whitespace) {
            Some((command, args)) => (command.to_uppercase(), args.trim()),
            None => (line.to_uppercase(), ""),
        };

        match command.as_str() {
            "HELO" => Ok(SmtpCommand::Helo(Self::parse_domain(args)?)),
            "EHLO" => Ok(SmtpCommand::Ehlo(Self::parse_domain(args)?)),
            "MAIL" => {
                // MAIL FROM:<address> [parameters]
                let rest = Self::strip_keyword(args, "FROM:")
                    .ok_or(ParseError::Syntax("Invalid MAIL FROM syntax"))?;
                let (address, params) = Self::parse_path(rest)?;
                Ok(SmtpCommand::MailFrom(address, params))
            }
            "RCPT" => {
                // RCPT TO:<address>
                let rest = Self::strip_keyword(args, "TO:")
                    .ok_or(ParseError::Syntax("Invalid RCPT TO syntax"))?;
                let (address, _params) = Self::parse_path(rest)?;
                if address.is_empty() {
                    return Err(ParseError::Syntax("Empty recipient"));
                }
                Ok(SmtpCommand::RcptTo(address))
            }
            "DATA" => Ok(SmtpCommand::Data),
            "RSET" => Ok(SmtpCommand::Rset),
            "QUIT" => Ok(SmtpCommand::Quit),
            "NOOP" => Ok(SmtpCommand::Noop),
            "STARTTLS" => Ok(SmtpCommand::Starttls),
            "AUTH" => {
                let mut parts = args.split_whitespace();
                let mechanism = parts
                    .next()
                    .ok_or(ParseError::Syntax("AUTH requires a mechanism"))?;
                let initial_response = parts.next().map(str::to_string);
                if parts.next().is_some() {
                    return Err(ParseError::Syntax("Too many AUTH arguments"));
                }
                Ok(SmtpCommand::Auth(mechanism.to_uppercase(), initial_response))
            }
            _ => Ok(SmtpCommand::Unknown(command)),
        }
    }

    /// Value of a `SIZE=` parameter given with MAIL FROM
    pub fn declared_size(params: &[String]) -> Option<usize> {
        params.iter().find_map(|param| {
            let (key, value) = param.split_once('=')?;
            if key.eq_ignore_ascii_case("SIZE") {
                value.parse().ok()
            } else {
                None
            }
        })
    }

    fn parse_domain(args: &str) -> Result<String, ParseError> {
        args.split_whitespace()
            .next()
            .map(str::to_string)
            .ok_or(ParseError::Syntax("Missing parameter"))
    }

    fn strip_keyword<'a>(args: &'a str, keyword: &str) -> Option<&'a str> {
        let head = args.get(..keyword.len())?;
        if head.eq_ignore_ascii_case(keyword) {
            Some(args[keyword.len()..].trim_start())
        } else {
            None
        }
    }

    /// Split `<address> PARAM=value ...` into the bare address and its parameters
    fn parse_path(rest: &str) -> Result<(String, Vec<String>), ParseError> {
        let (address, params) = if let Some(inner) = rest.strip_prefix('<') {
            let end = inner
                .find('>')
                .ok_or(ParseError::Syntax("Unterminated address"))?;
            (&inner[..end], &inner[end + 1..])
        } else {
            match rest.split_once(char::is_whitespace) {
                Some((address, params)) => (address, params),
                None => (rest, ""),
            }
        };

        if address.is_empty() && !rest.starts_with('<') {
            return Err(ParseError::Syntax("Missing address"));
        }
        if address.chars().any(|c| c.is_whitespace() || c == '<') {
            return Err(ParseError::Syntax("Malformed address"));
        }

        let params = params.split_whitespace().map(str::to_string).collect();
        Ok((address.to_string(), params))
    }
}
